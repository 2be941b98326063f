use chrono::NaiveDateTime;
use serde::Serialize;

use crate::error::{ExecError, Result};
use crate::protocol::codec::{date_from_millis, unpack};

/// Values of one result column. The variant name is the runtime type name
/// sent ahead of the values during a READ.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "values")]
pub enum ColumnValues {
    Int32(Vec<i32>),
    Double(Vec<f64>),
    Boolean(Vec<bool>),
    DateTime(Vec<NaiveDateTime>),
    String(Vec<String>),
}

impl ColumnValues {
    pub fn type_name(&self) -> &'static str {
        match self {
            ColumnValues::Int32(_) => "Int32",
            ColumnValues::Double(_) => "Double",
            ColumnValues::Boolean(_) => "Boolean",
            ColumnValues::DateTime(_) => "DateTime",
            ColumnValues::String(_) => "String",
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ColumnValues::Int32(v) => v.len(),
            ColumnValues::Double(v) => v.len(),
            ColumnValues::Boolean(v) => v.len(),
            ColumnValues::DateTime(v) => v.len(),
            ColumnValues::String(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pack the values into a single frame payload.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            ColumnValues::Int32(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            ColumnValues::Double(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            ColumnValues::Boolean(v) => v.iter().map(|x| u8::from(*x)).collect(),
            ColumnValues::DateTime(v) => v
                .iter()
                .flat_map(|x| x.and_utc().timestamp_millis().to_le_bytes())
                .collect(),
            ColumnValues::String(v) => {
                let mut payload = Vec::new();
                for s in v {
                    payload.extend_from_slice(&(s.len() as u32).to_le_bytes());
                    payload.extend_from_slice(s.as_bytes());
                }
                payload
            }
        }
    }

    /// Inverse of [`ColumnValues::encode`], driven by the type name.
    pub fn decode(type_name: &str, payload: &[u8]) -> Result<Self> {
        Ok(match type_name {
            "Int32" => ColumnValues::Int32(unpack(payload, i32::from_le_bytes)?),
            "Double" => ColumnValues::Double(unpack(payload, f64::from_le_bytes)?),
            "Boolean" => ColumnValues::Boolean(payload.iter().map(|b| *b != 0).collect()),
            "DateTime" => ColumnValues::DateTime(
                unpack(payload, i64::from_le_bytes)?
                    .into_iter()
                    .map(date_from_millis)
                    .collect::<Result<_>>()?,
            ),
            "String" => ColumnValues::String(decode_strings(payload)?),
            other => {
                return Err(ExecError::Protocol(format!(
                    "unknown column type '{}'",
                    other
                )))
            }
        })
    }
}

fn decode_strings(mut payload: &[u8]) -> Result<Vec<String>> {
    let truncated = || ExecError::Protocol("truncated string column".to_string());
    let mut values = Vec::new();
    while !payload.is_empty() {
        let (len, rest) = payload.split_first_chunk::<4>().ok_or_else(truncated)?;
        let len = u32::from_le_bytes(*len) as usize;
        if rest.len() < len {
            return Err(truncated());
        }
        let (text, rest) = rest.split_at(len);
        values.push(
            String::from_utf8(text.to_vec())
                .map_err(|_| ExecError::Protocol("column value is not valid UTF-8".to_string()))?,
        );
        payload = rest;
    }
    Ok(values)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Column {
    pub name: String,
    pub values: ColumnValues,
}

/// A named result table made of typed columns.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DataTable {
    pub name: String,
    columns: Vec<Column>,
}

impl DataTable {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
        }
    }

    pub fn with_column(mut self, name: impl Into<String>, values: ColumnValues) -> Self {
        self.push_column(name, values);
        self
    }

    /// Add a column, replacing any existing column of the same name.
    pub fn push_column(&mut self, name: impl Into<String>, values: ColumnValues) {
        let name = name.into();
        match self.columns.iter_mut().find(|c| c.name == name) {
            Some(existing) => existing.values = values,
            None => self.columns.push(Column { name, values }),
        }
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn num_rows(&self) -> usize {
        self.columns.first().map(|c| c.values.len()).unwrap_or(0)
    }

    /// Resolve the requested columns in order, failing on the first one that
    /// does not exist.
    pub fn select(&self, names: &[String]) -> Result<Vec<&Column>> {
        names
            .iter()
            .map(|name| {
                self.column(name).ok_or_else(|| ExecError::ColumnNotFound {
                    table: self.name.clone(),
                    column: name.clone(),
                })
            })
            .collect()
    }
}
