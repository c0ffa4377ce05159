use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{BrokerError, Result};
use crate::scheduler::CallRecord;

/// One callable remote function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionSpec {
    /// Name clients submit
    pub name: String,
    /// Name of the function inside the worker
    pub remote: String,
    /// Parameters in call-template order
    pub params: Vec<String>,
}

impl FunctionSpec {
    pub fn new(name: &str, remote: &str, params: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            remote: remote.to_string(),
            params: params.iter().map(|p| p.to_string()).collect(),
        }
    }
}

/// The set of functions the broker accepts.
///
/// Submissions are validated here before they are queued: unknown functions
/// and argument objects that do not match the declared parameters are
/// rejected as input errors.
#[derive(Debug, Clone)]
pub struct FunctionCatalog {
    functions: HashMap<String, FunctionSpec>,
}

impl Default for FunctionCatalog {
    fn default() -> Self {
        Self::from_specs(vec![
            FunctionSpec::new(
                "stewart",
                "stewart_to_json",
                &["var_name", "typefct", "span", "beta", "resolution", "mask_json"],
            ),
            FunctionSpec::new(
                "gridded",
                "make_gridded_map",
                &["layer_json_path", "var_name", "cellsize"],
            ),
            FunctionSpec::new(
                "links",
                "getLinkLayer_json",
                &["layer_json_path", "csv_table", "i", "j", "fij", "join_field"],
            ),
        ])
    }
}

impl FunctionCatalog {
    pub fn from_specs(specs: Vec<FunctionSpec>) -> Self {
        Self {
            functions: specs.into_iter().map(|s| (s.name.clone(), s)).collect(),
        }
    }

    /// Load a catalog from a JSON array of [`FunctionSpec`].
    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read(path).await?;
        let specs: Vec<FunctionSpec> = serde_json::from_slice(&raw)?;
        if specs.is_empty() {
            return Err(BrokerError::InvalidInput(format!(
                "function catalog {} is empty",
                path.display()
            )));
        }
        Ok(Self::from_specs(specs))
    }

    pub fn get(&self, name: &str) -> Option<&FunctionSpec> {
        self.functions.get(name)
    }

    /// Function specs sorted by name
    pub fn specs(&self) -> Vec<&FunctionSpec> {
        let mut specs: Vec<&FunctionSpec> = self.functions.values().collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    /// Validate `args` against `function` and build its call record.
    pub fn build_call(&self, function: &str, args: &Value) -> Result<CallRecord> {
        let spec = self
            .get(function)
            .ok_or_else(|| BrokerError::UnknownFunction(function.to_string()))?;

        let object = args.as_object().ok_or_else(|| {
            BrokerError::InvalidInput(format!("arguments of {} must be a JSON object", function))
        })?;

        if let Some(missing) = spec.params.iter().find(|p| !object.contains_key(p.as_str())) {
            return Err(BrokerError::InvalidInput(format!(
                "missing argument {} for {}",
                missing, function
            )));
        }
        if let Some(extra) = object.keys().find(|k| !spec.params.contains(k)) {
            return Err(BrokerError::InvalidInput(format!(
                "unexpected argument {} for {}",
                extra, function
            )));
        }

        Ok(CallRecord {
            function: spec.name.clone(),
            remote_function: spec.remote.clone(),
            param_names: spec.params.clone(),
            args: object.clone(),
        })
    }
}
