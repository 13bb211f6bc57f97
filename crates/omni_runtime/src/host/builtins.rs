//! Built-in host modules exposed through the catalogue.

use super::{HostError, HostObject, HostResult, HostValue, OutputSink, PropertyBag};

fn missing_method(type_name: &str, name: &str) -> HostError {
    HostError::MissingMethod {
        type_name: type_name.to_string(),
        name: name.to_string(),
    }
}

/// Script rounding: halves go towards +infinity.
fn round_half_up(x: f64) -> f64 {
    let floor = x.floor();
    if x - floor >= 0.5 {
        floor + 1.0
    } else {
        floor
    }
}

pub(super) fn console(sink: OutputSink) -> HostValue {
    HostValue::object(Console { sink })
}

pub(super) fn math() -> HostValue {
    HostValue::object(MathModule)
}

pub(super) fn json() -> HostValue {
    HostValue::object(JsonModule)
}

pub(super) fn object() -> HostValue {
    HostValue::object(ObjectModule)
}

struct Console {
    sink: OutputSink,
}

impl HostObject for Console {
    fn type_name(&self) -> &'static str {
        "console"
    }

    fn has_method(&self, name: &str) -> bool {
        matches!(name, "log" | "info" | "warn" | "error")
    }

    fn call_method(&self, name: &str, args: Vec<HostValue>) -> HostResult<HostValue> {
        if !self.has_method(name) {
            return Err(missing_method(self.type_name(), name));
        }
        let line = args
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" ");
        self.sink.write_line(&line);
        Ok(HostValue::Null)
    }
}

struct MathModule;

impl MathModule {
    fn number(args: &[HostValue], index: usize) -> f64 {
        args.get(index)
            .and_then(HostValue::as_number)
            .unwrap_or(f64::NAN)
    }
}

impl HostObject for MathModule {
    fn type_name(&self) -> &'static str {
        "Math"
    }

    fn get_property(&self, name: &str) -> HostResult<HostValue> {
        match name {
            "PI" => Ok(HostValue::Number(std::f64::consts::PI)),
            "E" => Ok(HostValue::Number(std::f64::consts::E)),
            _ => Err(HostError::MissingProperty {
                type_name: self.type_name().to_string(),
                name: name.to_string(),
            }),
        }
    }

    fn has_method(&self, name: &str) -> bool {
        matches!(
            name,
            "abs" | "floor" | "ceil" | "round" | "sqrt" | "pow" | "min" | "max" | "random"
        )
    }

    fn call_method(&self, name: &str, args: Vec<HostValue>) -> HostResult<HostValue> {
        let x = Self::number(&args, 0);
        let result = match name {
            "abs" => x.abs(),
            "floor" => x.floor(),
            "ceil" => x.ceil(),
            "round" => round_half_up(x),
            "sqrt" => x.sqrt(),
            "pow" => x.powf(Self::number(&args, 1)),
            "min" => args
                .iter()
                .map(|a| a.as_number().unwrap_or(f64::NAN))
                .fold(f64::INFINITY, |acc, n| if n.is_nan() || acc.is_nan() { f64::NAN } else { acc.min(n) }),
            "max" => args
                .iter()
                .map(|a| a.as_number().unwrap_or(f64::NAN))
                .fold(f64::NEG_INFINITY, |acc, n| if n.is_nan() || acc.is_nan() { f64::NAN } else { acc.max(n) }),
            "random" => rand::random::<f64>(),
            _ => return Err(missing_method(self.type_name(), name)),
        };
        // Integral results come back as raw ints to the guest.
        if result.fract() == 0.0 && result >= f64::from(i32::MIN) && result <= f64::from(i32::MAX) {
            Ok(HostValue::Int(result as i32))
        } else {
            Ok(HostValue::Number(result))
        }
    }
}

struct JsonModule;

impl HostObject for JsonModule {
    fn type_name(&self) -> &'static str {
        "JSON"
    }

    fn has_method(&self, name: &str) -> bool {
        matches!(name, "stringify" | "parse")
    }

    fn call_method(&self, name: &str, args: Vec<HostValue>) -> HostResult<HostValue> {
        let arg = args.into_iter().next().unwrap_or(HostValue::Null);
        match name {
            "stringify" => Ok(HostValue::string(arg.to_json().to_string())),
            "parse" => {
                let text = arg
                    .as_str()
                    .ok_or_else(|| HostError::InvalidArgument("JSON.parse expects a string".into()))?;
                let value: serde_json::Value = serde_json::from_str(text)
                    .map_err(|e| HostError::Failed(format!("JSON.parse: {e}")))?;
                Ok(HostValue::from_json(value))
            }
            _ => Err(missing_method(self.type_name(), name)),
        }
    }
}

struct ObjectModule;

impl HostObject for ObjectModule {
    fn type_name(&self) -> &'static str {
        "Object"
    }

    fn has_method(&self, name: &str) -> bool {
        matches!(name, "create" | "keys")
    }

    fn call_method(&self, name: &str, args: Vec<HostValue>) -> HostResult<HostValue> {
        match name {
            "create" => Ok(HostValue::object(PropertyBag::new())),
            "keys" => {
                let keys = match args.first().map(HostValue::to_json) {
                    Some(serde_json::Value::Object(map)) => map.keys().cloned().map(Into::into).collect(),
                    _ => Vec::new(),
                };
                Ok(HostValue::from_json(serde_json::Value::Array(keys)))
            }
            _ => Err(missing_method(self.type_name(), name)),
        }
    }
}
