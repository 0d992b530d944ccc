use crate::error::{Error, Result};
use crate::record::{is_reserved_key, Record};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

const TRUE_WORDS: [&str; 6] = ["true", "t", "yes", "y", "on", "1"];
const FALSE_WORDS: [&str; 6] = ["false", "f", "no", "n", "off", "0"];

pub fn parse_bool(raw: &str) -> Option<bool> {
    let lower = raw.trim().to_lowercase();
    if TRUE_WORDS.contains(&lower.as_str()) {
        Some(true)
    } else if FALSE_WORDS.contains(&lower.as_str()) {
        Some(false)
    } else {
        None
    }
}

/// Parses `key=value`; the value is read as JSON and falls back to a plain string.
pub fn parse_assignment(raw: &str) -> Result<(String, Value)> {
    let (key, val_raw) = raw
        .split_once('=')
        .ok_or_else(|| Error::Validation(format!("invalid assignment '{}': expected k=v", raw)))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(Error::Validation(format!(
            "invalid assignment '{}': key cannot be empty",
            raw
        )));
    }
    let parsed =
        serde_json::from_str::<Value>(val_raw).unwrap_or(Value::String(val_raw.to_string()));
    Ok((key.to_string(), parsed))
}

/// Finished parameter set handed over by the argument parser.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params {
    values: BTreeMap<String, Value>,
    volatile: BTreeSet<String>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the parameters of an earlier run, dropping `id`, `time` and `root`.
    pub fn from_record(path: &Path) -> Result<Self> {
        let record = Record::load(path)?;
        Ok(Self {
            values: record.params(),
            volatile: BTreeSet::new(),
        })
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Result<()> {
        let key = key.into();
        if is_reserved_key(&key) {
            return Err(Error::ReservedParam(key));
        }
        self.values.insert(key, value.into());
        Ok(())
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Result<Self> {
        self.set(key, value)?;
        Ok(self)
    }

    pub fn apply_assignment(&mut self, raw: &str) -> Result<()> {
        let (key, value) = parse_assignment(raw)?;
        self.set(key, value)
    }

    /// Keeps `key` available at runtime but out of the persisted record.
    pub fn mark_volatile(&mut self, key: impl Into<String>) {
        self.volatile.insert(key.into());
    }

    pub fn is_volatile(&self, key: &str) -> bool {
        self.volatile.contains(key)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    /// What goes into `params.yaml`.
    pub fn persisted(&self) -> BTreeMap<String, Value> {
        self.values
            .iter()
            .filter(|(k, _)| !self.volatile.contains(*k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// Result of a single validator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Check {
    Pass,
    Fail,
    /// Fail with an explanation appended to the registered message.
    FailWith(String),
}

impl From<bool> for Check {
    fn from(ok: bool) -> Self {
        if ok {
            Check::Pass
        } else {
            Check::Fail
        }
    }
}

type CheckFn = Box<dyn Fn(&Params) -> Check + Send + Sync>;

struct Validator {
    check: CheckFn,
    message: String,
}

/// Cross-parameter checks that must pass before a run directory is created.
#[derive(Default)]
pub struct Validators {
    validators: Vec<Validator>,
}

impl std::fmt::Debug for Validators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Validators")
            .field("count", &self.validators.len())
            .finish()
    }
}

impl Validators {
    pub fn new() -> Self {
        Self::default()
    }

    /// `message` may reference parameters as `{name}`.
    pub fn register<F, C>(&mut self, check: F, message: impl Into<String>)
    where
        F: Fn(&Params) -> C + Send + Sync + 'static,
        C: Into<Check>,
    {
        self.validators.push(Validator {
            check: Box::new(move |p: &Params| check(p).into()),
            message: message.into(),
        });
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    pub fn check(&self, params: &Params) -> Result<()> {
        for validator in &self.validators {
            let detail = match (validator.check)(params) {
                Check::Pass => continue,
                Check::Fail => None,
                Check::FailWith(detail) => Some(detail),
            };
            let mut message = render_template(&validator.message, params);
            if let Some(detail) = detail {
                message.push_str(": ");
                message.push_str(&detail);
            }
            return Err(Error::Validation(message));
        }
        Ok(())
    }
}

fn render_template(template: &str, params: &Params) -> String {
    let mut out = template.to_string();
    for (key, value) in params.values() {
        let needle = format!("{{{}}}", key);
        if out.contains(&needle) {
            let shown = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            out = out.replace(&needle, &shown);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_bool_accepts_common_spellings() {
        for t in ["true", "T", "yes", "Y", "on", "1"] {
            assert_eq!(parse_bool(t), Some(true), "{}", t);
        }
        for f in ["false", "F", "no", "N", "OFF", "0"] {
            assert_eq!(parse_bool(f), Some(false), "{}", f);
        }
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn assignment_values_are_json_with_string_fallback() {
        assert_eq!(parse_assignment("lr=0.5").expect("lr"), ("lr".to_string(), json!(0.5)));
        assert_eq!(
            parse_assignment("layers=[1,2]").expect("layers"),
            ("layers".to_string(), json!([1, 2]))
        );
        assert_eq!(
            parse_assignment("name=resnet").expect("name"),
            ("name".to_string(), json!("resnet"))
        );
        assert_eq!(
            parse_assignment("expr=a=b").expect("expr"),
            ("expr".to_string(), json!("a=b"))
        );
        assert!(parse_assignment("novalue").is_err());
        assert!(parse_assignment("=1").is_err());
    }

    #[test]
    fn reserved_keys_cannot_be_set() {
        let mut params = Params::new();
        for key in ["id", "time", "root"] {
            let err = params.set(key, 1).expect_err("reserved");
            assert!(matches!(err, Error::ReservedParam(_)));
        }
        assert!(params.values().is_empty());
    }

    #[test]
    fn volatile_keys_are_not_persisted() {
        let mut params = Params::new().with("lr", 0.1).expect("lr");
        params.set("device", "cuda:0").expect("device");
        params.mark_volatile("device");
        assert_eq!(params.get("device"), Some(&json!("cuda:0")));
        let persisted = params.persisted();
        assert!(persisted.contains_key("lr"));
        assert!(!persisted.contains_key("device"));
    }

    #[test]
    fn validators_render_messages_from_params() {
        let mut validators = Validators::new();
        validators.register(|p: &Params| p.get("param") != Some(&json!("x")), "should be not x, got {param}");
        validators.register(
            |p: &Params| {
                if p.get("param") == Some(&json!("z")) {
                    Check::FailWith("z is banned".to_string())
                } else {
                    Check::Pass
                }
            },
            "bad value {param}",
        );

        let ok = Params::new().with("param", "y").expect("param");
        validators.check(&ok).expect("y passes");

        let x = Params::new().with("param", "x").expect("param");
        let err = validators.check(&x).expect_err("x fails");
        assert!(err.to_string().contains("got x"), "unexpected: {}", err);

        let z = Params::new().with("param", "z").expect("param");
        let err = validators.check(&z).expect_err("z fails");
        assert!(err.to_string().contains("bad value z: z is banned"), "unexpected: {}", err);
    }
}
