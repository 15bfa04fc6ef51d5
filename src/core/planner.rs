// src/core/planner.rs

//! The role-capacity planner seam. The planning algorithm itself is an
//! external library; this module owns the trait it is invoked through,
//! the assembly and validation of its configuration from the model and
//! machine parameter files, and the rate-based default implementation.

use crate::config::{ControllerConfig, STRICT_FILE_MODE, check_file_mode};
use crate::core::errors::ControllerError;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

const MIN_PARAM: f64 = 1e-6;
const MAX_PARAM: f64 = 2147483647.0;
const MAX_EFFICIENCY: f64 = 1.0;

const MODEL_KEYS: [&str; 7] = [
    "hidden_size",
    "initializer_range",
    "intermediate_size",
    "max_position_embeddings",
    "num_attention_heads",
    "num_hidden_layers",
    "num_key_value_heads",
];
const MACHINE_KEYS: [&str; 7] = [
    "BW_GB",
    "BW_RDMA_Gb",
    "TFLOPS",
    "MBW_TB",
    "alpha",
    "MEMCapacity",
    "staticTransferDelay",
];
const MACHINE_EFF_KEYS: [&str; 4] = ["BWeff", "TFLOPSeff", "MBW_TBeff", "eta_OOM"];
const VALID_DTYPES: [&str; 2] = ["float16", "bfloat16"];

/// Current utilization of one group, fed to the planner.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GroupLoad {
    pub group_id: u64,
    /// Nodes eligible for prefill/decode assignment (flex excluded).
    pub node_count: usize,
    pub flex_count: usize,
    pub total_slots: u64,
    pub avail_slots: u64,
    pub total_blocks: u64,
    pub avail_blocks: u64,
    pub waiting_requests: u64,
}

/// Desired role distribution for one group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupPlan {
    pub group_id: u64,
    pub prefill_count: usize,
    pub decode_count: usize,
    pub flex_count: usize,
    /// Fraction of flex capacity devoted to prefill, 0-100.
    pub flex_p_ratio: u64,
}

/// The planner seam. Implementations decide how many prefill and decode
/// workers each group should run given its current load.
pub trait RolePlanner: Send + Sync {
    fn plan(&self, loads: &[GroupLoad]) -> Vec<GroupPlan>;
}

/// Default planner: splits each group by the configured static rates.
/// Groups with at least two eligible nodes always keep one of each phase.
pub struct RatePlanner {
    p_rate: u32,
    d_rate: u32,
    flex_p_ratio: u64,
}

impl RatePlanner {
    pub fn new(p_rate: u32, d_rate: u32) -> Self {
        let denominator = (p_rate + d_rate).max(1) as u64;
        Self {
            p_rate,
            d_rate,
            flex_p_ratio: (p_rate as u64 * 100) / denominator,
        }
    }

    pub fn from_config(config: &ControllerConfig) -> Self {
        Self::new(config.default_p_rate, config.default_d_rate)
    }
}

impl RolePlanner for RatePlanner {
    fn plan(&self, loads: &[GroupLoad]) -> Vec<GroupPlan> {
        loads
            .iter()
            .map(|load| {
                let total = load.node_count;
                let denominator = (self.p_rate + self.d_rate).max(1) as usize;
                let mut prefill = total * self.p_rate as usize / denominator;
                if total >= 2 {
                    prefill = prefill.clamp(1, total - 1);
                } else {
                    prefill = prefill.min(total);
                }
                GroupPlan {
                    group_id: load.group_id,
                    prefill_count: prefill,
                    decode_count: total - prefill,
                    flex_count: load.flex_count,
                    flex_p_ratio: self.flex_p_ratio,
                }
            })
            .collect()
    }
}

/// The configuration bundle handed to the external planner library:
/// validated model parameters, validated machine parameters, and the
/// `digs` tunables forwarded verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannerContext {
    pub model_params: BTreeMap<String, String>,
    pub machine_params: BTreeMap<String, String>,
    pub tunables: BTreeMap<String, String>,
}

impl PlannerContext {
    /// Reads and validates both parameter files named in the controller
    /// config. Any missing, mistyped, or out-of-range key is
    /// `InvalidConfig`.
    pub fn build(config: &ControllerConfig) -> Result<Self, ControllerError> {
        let model = read_params_file(
            Path::new(&config.model_config_path),
            config.check_mounted_files,
        )?;
        validate_model_params(&model)?;
        let machine = read_params_file(
            Path::new(&config.machine_config_path),
            config.check_mounted_files,
        )?;
        validate_machine_params(&machine)?;

        let mut model_params = collect_params(&model, &MODEL_KEYS);
        model_params.insert(
            "torch_dtype".into(),
            model["torch_dtype"].as_str().unwrap_or_default().into(),
        );
        let mut machine_params = collect_params(&machine, &MACHINE_KEYS);
        machine_params.append(&mut collect_params(&machine, &MACHINE_EFF_KEYS));

        Ok(Self {
            model_params,
            machine_params,
            tunables: config.digs.to_params(),
        })
    }
}

fn read_params_file(path: &Path, strict: bool) -> Result<Value, ControllerError> {
    let contents = fs::read_to_string(path).map_err(|e| {
        ControllerError::InvalidConfig(format!(
            "failed to read parameter file '{}': {e}",
            path.display()
        ))
    })?;
    if strict {
        check_file_mode(path, STRICT_FILE_MODE)?;
    }
    serde_json::from_str(&contents).map_err(|e| {
        ControllerError::InvalidConfig(format!(
            "parameter file '{}' is not valid JSON: {e}",
            path.display()
        ))
    })
}

/// Parameter values may arrive as JSON numbers or numeric strings.
fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn check_range(
    doc: &Value,
    key: &str,
    min: f64,
    max: f64,
    what: &str,
) -> Result<(), ControllerError> {
    let Some(value) = doc.get(key).and_then(value_as_f64) else {
        return Err(ControllerError::InvalidConfig(format!(
            "{what} parameter '{key}' is missing or not numeric"
        )));
    };
    if !(min..=max).contains(&value) {
        return Err(ControllerError::InvalidConfig(format!(
            "{what} parameter '{key}' = {value} is outside [{min}, {max}]"
        )));
    }
    Ok(())
}

/// Validates a model parameter document against the planner's ranges.
pub fn validate_model_params(doc: &Value) -> Result<(), ControllerError> {
    for key in MODEL_KEYS {
        check_range(doc, key, MIN_PARAM, MAX_PARAM, "model")?;
    }
    let dtype = doc.get("torch_dtype").and_then(Value::as_str).unwrap_or("");
    if !VALID_DTYPES.contains(&dtype) {
        return Err(ControllerError::InvalidConfig(format!(
            "model parameter 'torch_dtype' must be one of {VALID_DTYPES:?}, got '{dtype}'"
        )));
    }
    Ok(())
}

/// Validates a machine parameter document against the planner's ranges.
pub fn validate_machine_params(doc: &Value) -> Result<(), ControllerError> {
    for key in MACHINE_KEYS {
        check_range(doc, key, MIN_PARAM, MAX_PARAM, "machine")?;
    }
    for key in MACHINE_EFF_KEYS {
        check_range(doc, key, MIN_PARAM, MAX_EFFICIENCY, "machine")?;
    }
    Ok(())
}

fn collect_params(doc: &Value, keys: &[&str]) -> BTreeMap<String, String> {
    keys.iter()
        .filter_map(|key| {
            let value = doc.get(*key)?;
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            Some(((*key).to_string(), rendered))
        })
        .collect()
}
