// SPDX-FileCopyrightText: © 2025 Castflow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Utility functions for module configuration.

/// Helper functions for parsing module configuration from JSON values.
pub mod config_helpers {
    use crate::error::CastflowError;
    use serde::Deserialize;

    /// Parses configuration from an optional JSON value, using defaults for
    /// anything not provided. The preferred approach for modules with
    /// sensible defaults.
    ///
    /// # Errors
    ///
    /// Returns `CastflowError::InvalidConfig` if a provided value does not
    /// deserialize.
    pub fn parse_config_optional<T>(params: Option<&serde_json::Value>) -> Result<T, CastflowError>
    where
        T: for<'de> Deserialize<'de> + Default,
    {
        match params {
            None | Some(serde_json::Value::Null) => Ok(T::default()),
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| CastflowError::InvalidConfig(format!("failed to parse config: {e}"))),
        }
    }

    /// Parses configuration from an optional JSON value, erroring if not
    /// provided. Use for modules that require explicit configuration.
    ///
    /// # Errors
    ///
    /// Returns `CastflowError::InvalidConfig` if `params` is `None` or if
    /// deserialization fails.
    pub fn parse_config_required<T>(params: Option<&serde_json::Value>) -> Result<T, CastflowError>
    where
        T: for<'de> Deserialize<'de>,
    {
        let value =
            params.ok_or_else(|| CastflowError::InvalidConfig("configuration required".to_string()))?.clone();
        serde_json::from_value(value)
            .map_err(|e| CastflowError::InvalidConfig(format!("failed to parse config: {e}")))
    }
}
