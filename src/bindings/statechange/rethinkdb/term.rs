//! The handful of ReQL wire terms the change feed needs.

use serde::Deserialize;
use serde_json::{json, Value};

pub const START: u8 = 1;
pub const CONTINUE: u8 = 2;
pub const STOP: u8 = 3;

const DB: u16 = 14;
const TABLE: u16 = 15;
const CHANGES: u16 = 152;

/// `r.db(database).table(table).changes({include_types: true})`
pub fn changes(database: &str, table: &str) -> Value {
    json!([
        CHANGES,
        [[TABLE, [[DB, [database]], table]]],
        {"include_types": true}
    ])
}

pub fn start(term: Value) -> Vec<u8> {
    json!([START, term, {}]).to_string().into_bytes()
}

pub fn continue_query() -> Vec<u8> {
    json!([CONTINUE]).to_string().into_bytes()
}

pub fn stop_query() -> Vec<u8> {
    json!([STOP]).to_string().into_bytes()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseType {
    SuccessAtom,
    SuccessSequence,
    SuccessPartial,
    WaitComplete,
    ServerInfo,
    ClientError,
    CompileError,
    RuntimeError,
    Unknown(i64),
}

impl From<i64> for ResponseType {
    fn from(code: i64) -> Self {
        match code {
            1 => Self::SuccessAtom,
            2 => Self::SuccessSequence,
            3 => Self::SuccessPartial,
            4 => Self::WaitComplete,
            5 => Self::ServerInfo,
            16 => Self::ClientError,
            17 => Self::CompileError,
            18 => Self::RuntimeError,
            other => Self::Unknown(other),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Response {
    pub t: i64,
    #[serde(default)]
    pub r: Vec<Value>,
}

impl Response {
    pub fn kind(&self) -> ResponseType {
        ResponseType::from(self.t)
    }

    /// First result entry rendered as text; error responses carry their message there.
    pub fn message(&self) -> String {
        match self.r.first() {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => format!("response type {}", self.t),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_changes_term_shape() {
        let query: Value = serde_json::from_slice(&start(changes("app", "orders"))).unwrap();
        assert_eq!(
            query,
            json!([1, [152, [[15, [[14, ["app"]], "orders"]]], {"include_types": true}], {}])
        );
        assert_eq!(continue_query(), b"[2]");
        assert_eq!(stop_query(), b"[3]");
    }

    #[test]
    fn test_response_kinds() {
        let r: Response = serde_json::from_str(r#"{"t":18,"r":["Table `x` does not exist."]}"#).unwrap();
        assert_eq!(r.kind(), ResponseType::RuntimeError);
        assert_eq!(r.message(), "Table `x` does not exist.");

        let r: Response = serde_json::from_str(r#"{"t":3,"r":[],"n":[1]}"#).unwrap();
        assert_eq!(r.kind(), ResponseType::SuccessPartial);
        assert_eq!(ResponseType::from(99), ResponseType::Unknown(99));
    }
}
