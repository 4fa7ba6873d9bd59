use std::fmt;
use std::str::FromStr;

use crate::{RelayError, Result};

const EMIT_ZERO: &str = "emit_zero";

/// Routing and behaviour encoded in a CloudWatch query label.
///
/// Wire form is `<type>=<id>:<name>[;<opt>]*` where type is `service` or `host`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label {
    pub service: String,
    pub host_id: String,
    pub name: String,
    pub emit_zero: bool,
}

/// A decoded label plus any option tokens that were not understood.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded<'a> {
    pub label: Label,
    pub ignored: Vec<&'a str>,
}

impl Label {
    pub fn service(service: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn host(host_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            host_id: host_id.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_emit_zero(mut self, emit_zero: bool) -> Self {
        self.emit_zero = emit_zero;
        self
    }

    pub fn is_service(&self) -> bool {
        !self.service.is_empty()
    }

    pub fn decode(label: &str) -> Result<Decoded<'_>> {
        let invalid = || RelayError::InvalidLabelFormat(label.to_string());

        let (head, name_with_opts) = label.split_once(':').ok_or_else(invalid)?;
        let (kind, id) = head.split_once('=').ok_or_else(invalid)?;

        let mut parts = name_with_opts.split(';');
        let name = parts.next().unwrap_or_default();
        if kind.is_empty() || id.is_empty() || name.is_empty() {
            return Err(invalid());
        }

        let mut parsed = Label {
            name: name.to_string(),
            ..Default::default()
        };
        let mut ignored = Vec::new();
        for opt in parts {
            match opt {
                EMIT_ZERO => parsed.emit_zero = true,
                other => ignored.push(other),
            }
        }

        match kind {
            "service" => parsed.service = id.to_string(),
            "host" => parsed.host_id = id.to_string(),
            _ => {
                return Err(RelayError::UnknownLabelType {
                    kind: kind.to_string(),
                    label: label.to_string(),
                })
            }
        }

        Ok(Decoded {
            label: parsed,
            ignored,
        })
    }

    pub fn encode(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_service() {
            write!(f, "service={}:{}", self.service, self.name)?;
        } else {
            write!(f, "host={}:{}", self.host_id, self.name)?;
        }
        if self.emit_zero {
            write!(f, ";{}", EMIT_ZERO)?;
        }
        Ok(())
    }
}

impl FromStr for Label {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        Label::decode(s).map(|decoded| decoded.label)
    }
}
