//! Payload schemas and strict-mode validation.
//!
//! A [`Schema`] is a small JSON-schema-like tree, enough to describe OCPP-J
//! request and response PDUs. Schemas are registered per subprotocol, method
//! and [`Direction`] in a [`SchemaRegistry`]; a method without a schema is not
//! validated.

use once_cell::sync::Lazy;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

use super::error::{ErrorCode, RpcError, OCPP16};

/// Which half of an exchange a payload belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum Direction {
    #[strum(serialize = "req")]
    Request,
    #[strum(serialize = "conf")]
    Response,
}

/// String formats understood by the validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringFormat {
    /// RFC 3339 timestamp
    DateTime,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Schema {
    Any,
    Boolean,
    Integer {
        minimum: Option<i64>,
        maximum: Option<i64>,
    },
    Number {
        minimum: Option<f64>,
        maximum: Option<f64>,
    },
    String {
        max_length: Option<usize>,
        format: Option<StringFormat>,
    },
    Enum(Vec<String>),
    Array {
        items: Box<Schema>,
        min_items: Option<usize>,
        max_items: Option<usize>,
    },
    Object {
        properties: Vec<Property>,
        additional_properties: bool,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Property {
    pub name: String,
    pub schema: Schema,
    pub required: bool,
}

pub fn required(name: &str, schema: Schema) -> Property {
    Property {
        name: name.to_string(),
        schema,
        required: true,
    }
}

pub fn optional(name: &str, schema: Schema) -> Property {
    Property {
        name: name.to_string(),
        schema,
        required: false,
    }
}

impl Schema {
    /// Closed object: properties not listed are rejected.
    pub fn object(properties: impl IntoIterator<Item = Property>) -> Self {
        Self::Object {
            properties: properties.into_iter().collect(),
            additional_properties: false,
        }
    }

    /// Open object: unlisted properties are accepted unchecked.
    pub fn open_object(properties: impl IntoIterator<Item = Property>) -> Self {
        Self::Object {
            properties: properties.into_iter().collect(),
            additional_properties: true,
        }
    }

    pub fn string() -> Self {
        Self::String {
            max_length: None,
            format: None,
        }
    }

    pub fn string_max(max_length: usize) -> Self {
        Self::String {
            max_length: Some(max_length),
            format: None,
        }
    }

    pub fn date_time() -> Self {
        Self::String {
            max_length: None,
            format: Some(StringFormat::DateTime),
        }
    }

    pub fn integer() -> Self {
        Self::Integer {
            minimum: None,
            maximum: None,
        }
    }

    pub fn integer_min(minimum: i64) -> Self {
        Self::Integer {
            minimum: Some(minimum),
            maximum: None,
        }
    }

    pub fn number() -> Self {
        Self::Number {
            minimum: None,
            maximum: None,
        }
    }

    pub fn enumeration(values: &[&str]) -> Self {
        Self::Enum(values.iter().map(|v| v.to_string()).collect())
    }

    pub fn array(items: Schema) -> Self {
        Self::Array {
            items: Box::new(items),
            min_items: None,
            max_items: None,
        }
    }

    /// Check `value` against this schema, stopping at the first violation.
    pub fn validate(&self, value: &Value) -> Result<(), ValidationError> {
        self.check(value, "$")
    }

    fn check(&self, value: &Value, path: &str) -> Result<(), ValidationError> {
        let fail = |constraint| {
            Err(ValidationError {
                path: path.to_string(),
                constraint,
            })
        };

        match self {
            Schema::Any => Ok(()),
            Schema::Boolean => match value {
                Value::Bool(_) => Ok(()),
                _ => fail(Constraint::Type("boolean")),
            },
            Schema::Integer { minimum, maximum } => {
                let Some(n) = value.as_i64() else {
                    return fail(Constraint::Type("integer"));
                };
                match (*minimum, *maximum) {
                    (Some(min), _) if n < min => fail(Constraint::Minimum(min as f64)),
                    (_, Some(max)) if n > max => fail(Constraint::Maximum(max as f64)),
                    _ => Ok(()),
                }
            }
            Schema::Number { minimum, maximum } => {
                let Some(n) = value.as_f64() else {
                    return fail(Constraint::Type("number"));
                };
                if let Some(min) = *minimum {
                    if n < min {
                        return fail(Constraint::Minimum(min));
                    }
                }
                if let Some(max) = *maximum {
                    if n > max {
                        return fail(Constraint::Maximum(max));
                    }
                }
                Ok(())
            }
            Schema::String { max_length, format } => {
                let Some(s) = value.as_str() else {
                    return fail(Constraint::Type("string"));
                };
                if let Some(max) = *max_length {
                    if s.chars().count() > max {
                        return fail(Constraint::MaxLength(max));
                    }
                }
                match format {
                    Some(StringFormat::DateTime)
                        if chrono::DateTime::parse_from_rfc3339(s).is_err() =>
                    {
                        fail(Constraint::Format(StringFormat::DateTime))
                    }
                    _ => Ok(()),
                }
            }
            Schema::Enum(allowed) => {
                let Some(s) = value.as_str() else {
                    return fail(Constraint::Type("string"));
                };
                if allowed.iter().any(|a| a == s) {
                    Ok(())
                } else {
                    fail(Constraint::Enum(allowed.clone()))
                }
            }
            Schema::Array {
                items,
                min_items,
                max_items,
            } => {
                let Some(elements) = value.as_array() else {
                    return fail(Constraint::Type("array"));
                };
                if let Some(min) = *min_items {
                    if elements.len() < min {
                        return fail(Constraint::MinItems(min));
                    }
                }
                if let Some(max) = *max_items {
                    if elements.len() > max {
                        return fail(Constraint::MaxItems(max));
                    }
                }
                for (i, element) in elements.iter().enumerate() {
                    items.check(element, &format!("{path}[{i}]"))?;
                }
                Ok(())
            }
            Schema::Object {
                properties,
                additional_properties,
            } => {
                let Some(object) = value.as_object() else {
                    return fail(Constraint::Type("object"));
                };
                for property in properties {
                    let child = format!("{path}.{}", property.name);
                    match object.get(&property.name) {
                        Some(v) => property.schema.check(v, &child)?,
                        None if property.required => {
                            return Err(ValidationError {
                                path: child,
                                constraint: Constraint::Required,
                            })
                        }
                        None => {}
                    }
                }
                if !additional_properties {
                    if let Some(extra) = object
                        .keys()
                        .find(|k| !properties.iter().any(|p| &p.name == *k))
                    {
                        return Err(ValidationError {
                            path: format!("{path}.{extra}"),
                            constraint: Constraint::AdditionalProperty,
                        });
                    }
                }
                Ok(())
            }
        }
    }
}

/// The rule a payload broke.
#[derive(Debug, Clone, PartialEq)]
pub enum Constraint {
    Type(&'static str),
    Required,
    AdditionalProperty,
    Enum(Vec<String>),
    MaxLength(usize),
    Format(StringFormat),
    Minimum(f64),
    Maximum(f64),
    MinItems(usize),
    MaxItems(usize),
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Type(expected) => write!(f, "expected {expected}"),
            Self::Required => write!(f, "missing required field"),
            Self::AdditionalProperty => write!(f, "unexpected field"),
            Self::Enum(allowed) => write!(f, "value must be one of [{}]", allowed.join(", ")),
            Self::MaxLength(max) => write!(f, "longer than {max} characters"),
            Self::Format(StringFormat::DateTime) => write!(f, "not an RFC 3339 date-time"),
            Self::Minimum(min) => write!(f, "less than minimum {min}"),
            Self::Maximum(max) => write!(f, "greater than maximum {max}"),
            Self::MinItems(min) => write!(f, "fewer than {min} items"),
            Self::MaxItems(max) => write!(f, "more than {max} items"),
        }
    }
}

impl Constraint {
    /// Short keyword reported in CALLERROR details.
    pub fn keyword(&self) -> &'static str {
        match self {
            Self::Type(_) => "type",
            Self::Required => "required",
            Self::AdditionalProperty => "additionalProperties",
            Self::Enum(_) => "enum",
            Self::MaxLength(_) => "maxLength",
            Self::Format(_) => "format",
            Self::Minimum(_) => "minimum",
            Self::Maximum(_) => "maximum",
            Self::MinItems(_) => "minItems",
            Self::MaxItems(_) => "maxItems",
        }
    }
}

/// A payload that does not conform to its schema.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{constraint} at {path}")]
pub struct ValidationError {
    /// Location of the offending value, e.g. `$.idTagInfo.status`.
    pub path: String,
    pub constraint: Constraint,
}

impl ValidationError {
    pub fn error_code(&self, protocol: &str) -> ErrorCode {
        match self.constraint {
            Constraint::Type(_) => ErrorCode::TypeConstraintViolation,
            Constraint::Required
            | Constraint::Minimum(_)
            | Constraint::Maximum(_)
            | Constraint::MinItems(_)
            | Constraint::MaxItems(_) => ErrorCode::occurrence_violation(protocol),
            Constraint::AdditionalProperty => ErrorCode::PropertyConstraintViolation,
            Constraint::Enum(_) | Constraint::MaxLength(_) | Constraint::Format(_) => {
                ErrorCode::format_violation(protocol)
            }
        }
    }

    pub fn to_rpc_error(&self, protocol: &str) -> RpcError {
        RpcError::new(self.error_code(protocol))
            .with_description(self.to_string())
            .with_details(json!({
                "path": self.path,
                "constraint": self.constraint.keyword(),
            }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SchemaKey {
    protocol: String,
    method: String,
    direction: Direction,
}

/// Schemas keyed by subprotocol, method and direction.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<SchemaKey, Schema>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the schema for one half of a method.
    pub fn register(
        &mut self,
        protocol: &str,
        method: &str,
        direction: Direction,
        schema: Schema,
    ) -> Option<Schema> {
        self.schemas.insert(
            SchemaKey {
                protocol: protocol.to_string(),
                method: method.to_string(),
                direction,
            },
            schema,
        )
    }

    pub fn get(&self, protocol: &str, method: &str, direction: Direction) -> Option<&Schema> {
        self.schemas.get(&SchemaKey {
            protocol: protocol.to_string(),
            method: method.to_string(),
            direction,
        })
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }

    /// Validate a payload; methods without a registered schema pass.
    pub fn validate(
        &self,
        protocol: &str,
        method: &str,
        direction: Direction,
        payload: &Value,
    ) -> Result<(), ValidationError> {
        match self.get(protocol, method, direction) {
            Some(schema) => schema.validate(payload),
            None => Ok(()),
        }
    }

    /// The built-in OCPP 1.6 schema set.
    pub fn ocpp16() -> Self {
        let mut registry = Self::new();
        for (method, direction, schema) in ocpp16_schemas() {
            registry.register(OCPP16, method, direction, schema);
        }
        registry
    }
}

/// Shared copy of the built-in schemas.
pub static OCPP16_SCHEMAS: Lazy<SchemaRegistry> = Lazy::new(SchemaRegistry::ocpp16);

const CHARGE_POINT_ERROR_CODES: &[&str] = &[
    "ConnectorLockFailure",
    "EVCommunicationError",
    "GroundFailure",
    "HighTemperature",
    "InternalError",
    "LocalListConflict",
    "NoError",
    "OtherError",
    "OverCurrentFailure",
    "PowerMeterFailure",
    "PowerSwitchFailure",
    "ReaderFailure",
    "ResetFailure",
    "UnderVoltage",
    "OverVoltage",
    "WeakSignal",
];

const CHARGE_POINT_STATUSES: &[&str] = &[
    "Available",
    "Preparing",
    "Charging",
    "SuspendedEVSE",
    "SuspendedEV",
    "Finishing",
    "Reserved",
    "Unavailable",
    "Faulted",
];

fn ocpp16_schemas() -> Vec<(&'static str, Direction, Schema)> {
    use Direction::{Request, Response};

    let id_tag_info = Schema::object([
        optional("expiryDate", Schema::date_time()),
        optional("parentIdTag", Schema::string_max(20)),
        required(
            "status",
            Schema::enumeration(&["Accepted", "Blocked", "Expired", "Invalid", "ConcurrentTx"]),
        ),
    ]);

    vec![
        (
            "BootNotification",
            Request,
            // chargePointModel is deliberately optional: stations in the field
            // boot with only a vendor string.
            Schema::object([
                required("chargePointVendor", Schema::string_max(20)),
                optional("chargePointModel", Schema::string_max(20)),
                optional("chargePointSerialNumber", Schema::string_max(25)),
                optional("chargeBoxSerialNumber", Schema::string_max(25)),
                optional("firmwareVersion", Schema::string_max(50)),
                optional("iccid", Schema::string_max(20)),
                optional("imsi", Schema::string_max(20)),
                optional("meterType", Schema::string_max(25)),
                optional("meterSerialNumber", Schema::string_max(25)),
            ]),
        ),
        (
            "BootNotification",
            Response,
            Schema::object([
                required("status", Schema::enumeration(&["Accepted", "Pending", "Rejected"])),
                required("currentTime", Schema::date_time()),
                required("interval", Schema::integer()),
            ]),
        ),
        ("Heartbeat", Request, Schema::object([])),
        (
            "Heartbeat",
            Response,
            Schema::object([required("currentTime", Schema::date_time())]),
        ),
        (
            "StatusNotification",
            Request,
            Schema::object([
                required("connectorId", Schema::integer_min(0)),
                required("errorCode", Schema::enumeration(CHARGE_POINT_ERROR_CODES)),
                optional("info", Schema::string_max(50)),
                required("status", Schema::enumeration(CHARGE_POINT_STATUSES)),
                optional("timestamp", Schema::date_time()),
                optional("vendorId", Schema::string_max(255)),
                optional("vendorErrorCode", Schema::string_max(50)),
            ]),
        ),
        ("StatusNotification", Response, Schema::object([])),
        (
            "Authorize",
            Request,
            Schema::object([required("idTag", Schema::string_max(20))]),
        ),
        (
            "Authorize",
            Response,
            Schema::object([required("idTagInfo", id_tag_info)]),
        ),
        (
            "DataTransfer",
            Request,
            Schema::object([
                required("vendorId", Schema::string_max(255)),
                optional("messageId", Schema::string_max(50)),
                optional("data", Schema::string()),
            ]),
        ),
        (
            "DataTransfer",
            Response,
            Schema::object([
                required(
                    "status",
                    Schema::enumeration(&["Accepted", "Rejected", "UnknownMessageId", "UnknownVendorId"]),
                ),
                optional("data", Schema::string()),
            ]),
        ),
        (
            "Reset",
            Request,
            Schema::object([required("type", Schema::enumeration(&["Hard", "Soft"]))]),
        ),
        (
            "Reset",
            Response,
            Schema::object([required("status", Schema::enumeration(&["Accepted", "Rejected"]))]),
        ),
    ]
}
