//! `get_current_weather`: canned weather report for a location
//!
//! Stands in for a real weather backend so the tool-calling loop can be
//! exercised end to end without network access.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::{ParameterType, Tool, ToolDescriptor, ToolError, ToolParameter};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeatherFormat {
    #[default]
    #[serde(alias = "Celsius")]
    Celsius,
    #[serde(alias = "Fahrenheit")]
    Fahrenheit,
}

#[derive(Debug, Default, Deserialize)]
pub struct WeatherParams {
    pub location: String,
    #[serde(default)]
    pub format: WeatherFormat,
}

pub struct GetCurrentWeather;

impl GetCurrentWeather {
    pub const NAME: &'static str = "get_current_weather";
}

#[async_trait]
impl Tool for GetCurrentWeather {
    type Params = WeatherParams;

    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::new(Self::NAME, "Gets the current weather in the provided location.")
            .with_parameter(ToolParameter::new(
                "location",
                ParameterType::String,
                "The city and state, e.g. San Francisco, CA",
            ))
            .with_parameter(
                ToolParameter::new("format", ParameterType::String, "Temperature unit to report in")
                    .optional()
                    .with_enum(["celsius", "fahrenheit"])
                    .with_default("celsius"),
            )
    }

    async fn invoke(&self, params: WeatherParams) -> Result<String, ToolError> {
        let location = params.location.trim();
        if location.is_empty() {
            return Err(ToolError::InvalidParameters("location is required".into()));
        }

        let (temperature, unit) = match params.format {
            WeatherFormat::Celsius => (20, "celsius"),
            WeatherFormat::Fahrenheit => (68, "fahrenheit"),
        };

        Ok(json!({
            "location": location,
            "sunny": true,
            "temperature": temperature,
            "unit": unit,
        })
        .to_string())
    }
}
