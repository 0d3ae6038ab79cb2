//! Endpoint input schemas.
//!
//! Each endpoint declares its parameters once; the declaration is checked
//! for internal consistency when the endpoint is assembled, and incoming
//! request data is validated against it on every request.

use std::collections::{HashMap, HashSet};

use serde_json::{Map, Value};

use crate::{EngineError, SchemaError};

/// Wire type of a declared parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    String,
    Number,
    Boolean,
    Array,
    Object,
}

impl ParamType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
        }
    }

    fn matches(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
        }
    }
}

/// Declaration of one endpoint parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct InputParameter {
    param_type: ParamType,
    required: bool,
    default: Option<Value>,
    options: Option<Vec<Value>>,
    aliases: Vec<String>,
    depends_on: Vec<String>,
    exclusive: Vec<String>,
}

impl InputParameter {
    pub fn new(param_type: ParamType) -> Self {
        Self {
            param_type,
            required: false,
            default: None,
            options: None,
            aliases: Vec::new(),
            depends_on: Vec::new(),
            exclusive: Vec::new(),
        }
    }

    pub fn string() -> Self {
        Self::new(ParamType::String)
    }

    pub fn number() -> Self {
        Self::new(ParamType::Number)
    }

    pub fn boolean() -> Self {
        Self::new(ParamType::Boolean)
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    pub fn with_options(mut self, options: Vec<Value>) -> Self {
        self.options = Some(options);
        self
    }

    pub fn with_aliases(mut self, aliases: &[&str]) -> Self {
        self.aliases = aliases.iter().map(|alias| (*alias).to_owned()).collect();
        self
    }

    pub fn depends_on(mut self, names: &[&str]) -> Self {
        self.depends_on = names.iter().map(|name| (*name).to_owned()).collect();
        self
    }

    pub fn exclusive(mut self, names: &[&str]) -> Self {
        self.exclusive = names.iter().map(|name| (*name).to_owned()).collect();
        self
    }
}

/// Validated parameter schema: a static validation plan built once per
/// endpoint. Construction rejects inconsistent declarations.
#[derive(Debug, Clone)]
pub struct InputParameters {
    // Declaration order preserved for deterministic error reporting.
    declarations: Vec<(String, InputParameter)>,
    alias_to_name: HashMap<String, String>,
}

impl InputParameters {
    pub fn empty() -> Self {
        Self {
            declarations: Vec::new(),
            alias_to_name: HashMap::new(),
        }
    }

    pub fn new(declarations: Vec<(String, InputParameter)>) -> Result<Self, SchemaError> {
        let declared: HashSet<&str> = declarations
            .iter()
            .map(|(name, _)| name.as_str())
            .collect();

        let mut alias_to_name = HashMap::new();
        for (name, parameter) in &declarations {
            if parameter.required && parameter.default.is_some() {
                return Err(SchemaError::RequiredWithDefault { name: name.clone() });
            }

            if let Some(default) = &parameter.default {
                if !parameter.param_type.matches(default) {
                    return Err(SchemaError::DefaultTypeMismatch { name: name.clone() });
                }
            }

            for (relation, targets) in [
                ("depends_on", &parameter.depends_on),
                ("exclusive", &parameter.exclusive),
            ] {
                for target in targets {
                    if !declared.contains(target.as_str()) {
                        return Err(SchemaError::UnknownReference {
                            name: name.clone(),
                            target: target.clone(),
                            relation,
                        });
                    }
                }
            }

            for alias in &parameter.aliases {
                if declared.contains(alias.as_str())
                    || alias_to_name
                        .insert(alias.clone(), name.clone())
                        .is_some()
                {
                    return Err(SchemaError::DuplicateAlias {
                        alias: alias.clone(),
                    });
                }
            }
        }

        Ok(Self {
            declarations,
            alias_to_name,
        })
    }

    /// Validate raw request parameters against the plan.
    ///
    /// Returns the canonical parameter map: aliases resolved to declared
    /// names, defaults applied, undeclared keys dropped.
    pub fn validate(&self, raw: &Map<String, Value>) -> Result<Map<String, Value>, EngineError> {
        let mut resolved: Map<String, Value> = Map::new();

        for (name, parameter) in &self.declarations {
            let mut found: Option<(&str, &Value)> = raw.get(name).map(|value| (name.as_str(), value));

            for alias in &parameter.aliases {
                if let Some(value) = raw.get(alias) {
                    if found.is_some() {
                        return Err(EngineError::invalid_input(format!(
                            "parameter '{name}' was provided more than once via aliases"
                        )));
                    }
                    found = Some((alias.as_str(), value));
                }
            }

            match found {
                Some((_, value)) => {
                    if !parameter.param_type.matches(value) {
                        return Err(EngineError::invalid_input(format!(
                            "parameter '{name}' must be of type {}",
                            parameter.param_type.as_str()
                        )));
                    }

                    if let Some(options) = &parameter.options {
                        if !options.contains(value) {
                            return Err(EngineError::invalid_input(format!(
                                "parameter '{name}' must be one of the declared options"
                            )));
                        }
                    }

                    resolved.insert(name.clone(), value.clone());
                }
                None => {
                    if let Some(default) = &parameter.default {
                        resolved.insert(name.clone(), default.clone());
                    } else if parameter.required {
                        return Err(EngineError::invalid_input(format!(
                            "missing required parameter '{name}'"
                        )));
                    }
                }
            }
        }

        // Cross-parameter constraints are checked against the resolved
        // map so defaults participate.
        for (name, parameter) in &self.declarations {
            if !resolved.contains_key(name) {
                continue;
            }

            for dependency in &parameter.depends_on {
                if !resolved.contains_key(dependency) {
                    return Err(EngineError::invalid_input(format!(
                        "parameter '{name}' requires '{dependency}' to be present"
                    )));
                }
            }

            for rival in &parameter.exclusive {
                if resolved.contains_key(rival) {
                    return Err(EngineError::invalid_input(format!(
                        "parameters '{name}' and '{rival}' cannot be combined"
                    )));
                }
            }
        }

        Ok(resolved)
    }

    pub fn is_empty(&self) -> bool {
        self.declarations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(name, value)| ((*name).to_owned(), value.clone()))
            .collect()
    }

    #[test]
    fn mistyped_parameter_is_rejected() {
        let schema = InputParameters::new(vec![(
            String::from("base"),
            InputParameter::string().required(),
        )])
        .expect("schema must build");

        let error = schema
            .validate(&raw(&[("base", json!(123))]))
            .expect_err("must reject");
        assert_eq!(error.status_code(), 400);
    }

    #[test]
    fn exclusive_conflict_is_rejected() {
        let schema = InputParameters::new(vec![
            (
                String::from("base"),
                InputParameter::string().exclusive(&["quote"]),
            ),
            (String::from("quote"), InputParameter::string()),
        ])
        .expect("schema must build");

        let error = schema
            .validate(&raw(&[("base", json!("ETH")), ("quote", json!("USD"))]))
            .expect_err("must reject");
        assert_eq!(error.status_code(), 400);
    }

    #[test]
    fn default_applies_to_empty_input() {
        let schema = InputParameters::new(vec![(
            String::from("base"),
            InputParameter::string().with_default(json!("ETH")),
        )])
        .expect("schema must build");

        let validated = schema.validate(&Map::new()).expect("must validate");
        assert_eq!(validated["base"], json!("ETH"));
    }

    #[test]
    fn aliases_resolve_to_the_declared_name() {
        let schema = InputParameters::new(vec![(
            String::from("base"),
            InputParameter::string().required().with_aliases(&["from", "coin"]),
        )])
        .expect("schema must build");

        let validated = schema
            .validate(&raw(&[("from", json!("ETH"))]))
            .expect("must validate");
        assert_eq!(validated["base"], json!("ETH"));
    }

    #[test]
    fn providing_name_and_alias_together_is_rejected() {
        let schema = InputParameters::new(vec![(
            String::from("base"),
            InputParameter::string().with_aliases(&["from"]),
        )])
        .expect("schema must build");

        let error = schema
            .validate(&raw(&[("base", json!("ETH")), ("from", json!("BTC"))]))
            .expect_err("must reject");
        assert_eq!(error.status_code(), 400);
    }

    #[test]
    fn missing_required_parameter_is_rejected() {
        let schema = InputParameters::new(vec![(
            String::from("base"),
            InputParameter::string().required(),
        )])
        .expect("schema must build");

        let error = schema.validate(&Map::new()).expect_err("must reject");
        assert_eq!(error.status_code(), 400);
    }

    #[test]
    fn options_restrict_values() {
        let schema = InputParameters::new(vec![(
            String::from("quote"),
            InputParameter::string().with_options(vec![json!("USD"), json!("EUR")]),
        )])
        .expect("schema must build");

        assert!(schema.validate(&raw(&[("quote", json!("USD"))])).is_ok());
        assert!(schema.validate(&raw(&[("quote", json!("GBP"))])).is_err());
    }

    #[test]
    fn depends_on_is_enforced_after_defaults() {
        let schema = InputParameters::new(vec![
            (
                String::from("interval"),
                InputParameter::string().depends_on(&["base"]),
            ),
            (
                String::from("base"),
                InputParameter::string().with_default(json!("ETH")),
            ),
        ])
        .expect("schema must build");

        // Default satisfies the dependency.
        let validated = schema
            .validate(&raw(&[("interval", json!("1m"))]))
            .expect("must validate");
        assert_eq!(validated["base"], json!("ETH"));
    }

    #[test]
    fn required_with_default_is_an_invalid_schema() {
        let error = InputParameters::new(vec![(
            String::from("base"),
            InputParameter::string().required().with_default(json!("ETH")),
        )])
        .expect_err("schema must be rejected");
        assert!(matches!(error, SchemaError::RequiredWithDefault { .. }));
    }

    #[test]
    fn dangling_references_are_an_invalid_schema() {
        let error = InputParameters::new(vec![(
            String::from("base"),
            InputParameter::string().depends_on(&["ghost"]),
        )])
        .expect_err("schema must be rejected");
        assert!(matches!(error, SchemaError::UnknownReference { .. }));
    }

    #[test]
    fn duplicate_aliases_are_an_invalid_schema() {
        let error = InputParameters::new(vec![
            (
                String::from("base"),
                InputParameter::string().with_aliases(&["sym"]),
            ),
            (
                String::from("quote"),
                InputParameter::string().with_aliases(&["sym"]),
            ),
        ])
        .expect_err("schema must be rejected");
        assert!(matches!(error, SchemaError::DuplicateAlias { .. }));
    }

    #[test]
    fn undeclared_keys_are_dropped_from_the_canonical_map() {
        let schema = InputParameters::new(vec![(
            String::from("base"),
            InputParameter::string().required(),
        )])
        .expect("schema must build");

        let validated = schema
            .validate(&raw(&[("base", json!("ETH")), ("junk", json!(1))]))
            .expect("must validate");
        assert!(!validated.contains_key("junk"));
    }
}
