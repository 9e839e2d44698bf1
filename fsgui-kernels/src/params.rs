//! Small accessors for reading a validated `ParamValues` map inside a
//! kernel's `build`. Every kernel needs the same handful of coercions
//! (scalar-with-default, list-of-scalar), so they live here once instead
//! of being reimplemented per kernel.

use fsgui_core::types::ParamValues;
use fsgui_core::value::Value;

pub fn f64_or(params: &ParamValues, name: &str, default: f64) -> f64 {
    params.get(name).and_then(Value::as_f64).unwrap_or(default)
}

pub fn i64_or(params: &ParamValues, name: &str, default: i64) -> i64 {
    params.get(name).and_then(Value::as_i64).unwrap_or(default)
}

pub fn usize_or(params: &ParamValues, name: &str, default: usize) -> usize {
    i64_or(params, name, default as i64).max(0) as usize
}

pub fn bool_or(params: &ParamValues, name: &str, default: bool) -> bool {
    params.get(name).and_then(Value::as_bool).unwrap_or(default)
}

pub fn string_or<'a>(params: &'a ParamValues, name: &str, default: &'a str) -> &'a str {
    params.get(name).and_then(Value::as_str).unwrap_or(default)
}

pub fn f64_list(params: &ParamValues, name: &str) -> Vec<f64> {
    params
        .get(name)
        .and_then(Value::as_list)
        .map(|l| l.iter().filter_map(Value::as_f64).collect())
        .unwrap_or_default()
}

pub fn usize_list(params: &ParamValues, name: &str) -> Vec<usize> {
    params
        .get(name)
        .and_then(Value::as_list)
        .map(|l| l.iter().filter_map(Value::as_i64).map(|i| i.max(0) as usize).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_absent() {
        let params = ParamValues::new();
        assert_eq!(f64_or(&params, "sigma", 1.5), 1.5);
        assert_eq!(i64_or(&params, "n", 3), 3);
        assert!(!bool_or(&params, "flag", false));
    }

    #[test]
    fn reads_lists_filtering_wrong_element_types() {
        let mut params = ParamValues::new();
        params.insert(
            "channels".to_string(),
            Value::List(vec![Value::Int(0), Value::Int(2), Value::Bool(true)]),
        );
        assert_eq!(usize_list(&params, "channels"), vec![0, 2]);
    }
}
