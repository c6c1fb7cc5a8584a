use serde::Deserialize;

use crate::envelope::Method;
use crate::error::{Result, SignerError};

/// A reply from the U-Key, correlated to its request by `id`.
///
/// Real keys answer with `_args`/`Result`/`Data`/`Error`; the lowercase
/// spellings are accepted too. Unknown fields are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SignerResponse {
    #[serde(rename = "_id")]
    pub id: i32,
    #[serde(rename = "_method", default)]
    pub method: Option<String>,
    #[serde(rename = "_args", alias = "args", default)]
    pub args: ResponseArgs,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ResponseArgs {
    /// Absent is treated the same as `false`.
    #[serde(rename = "Result", alias = "result", default)]
    pub result: Option<bool>,
    #[serde(rename = "Data", alias = "data", default)]
    pub data: Option<Vec<String>>,
    #[serde(rename = "Error", alias = "error", default)]
    pub error: Option<Vec<String>>,
}

impl SignerResponse {
    pub fn decode(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn succeeded(&self) -> bool {
        self.args.result == Some(true)
    }

    /// The returned data items, empty when none were sent.
    pub fn data(&self) -> &[String] {
        self.args.data.as_deref().unwrap_or_default()
    }

    /// The first data item of a successful reply.
    pub fn first_data(&self) -> Option<&str> {
        if !self.succeeded() {
            return None;
        }
        self.data().first().map(String::as_str)
    }

    /// Failure text reported by the key, or a generic description.
    pub fn reason(&self) -> String {
        match self.args.error.as_deref() {
            Some(errors) if !errors.is_empty() => errors.join("; "),
            _ if self.args.result.is_none() => "reply carried no result".to_string(),
            _ => "signer returned result=false".to_string(),
        }
    }

    /// Data of a successful reply; `Rejected` otherwise.
    pub fn into_data(self, method: Method) -> Result<Vec<String>> {
        if !self.succeeded() {
            return Err(SignerError::Rejected {
                method: method.name(),
                reason: self.reason(),
            });
        }
        Ok(self.args.data.unwrap_or_default())
    }
}
