use std::collections::HashMap;

use chrono::{NaiveDate, NaiveDateTime};
use parking_lot::RwLock;

use crate::error::{ExecError, Result};
use crate::protocol::{ColumnValues, DataTable};

/// Name of the column identifying which simulation produced a row.
pub const SIMULATION_COLUMN: &str = "SimulationName";

#[derive(Debug, Default)]
struct StoredTable {
    /// Union of every column seen, in first-seen order.
    columns: Vec<String>,
    rows: Vec<Row>,
}

#[derive(Debug)]
struct Row {
    simulation: String,
    values: HashMap<String, String>,
}

/// In-memory store of the tables produced by simulations.
///
/// Values are kept as text and typed when a table is read: a column becomes
/// `Int32`, `Double`, `Boolean` or `DateTime` when every value parses as
/// that type, and `String` otherwise.
#[derive(Debug, Default)]
pub struct ResultStore {
    tables: RwLock<HashMap<String, StoredTable>>,
}

impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the rows of a comma-separated report whose first line is the
    /// header. Returns the number of rows added.
    ///
    /// Fields may be double-quoted to carry commas, with `""` for a literal
    /// quote. A record must fit on one line.
    pub fn insert_csv(&self, table: &str, simulation: &str, csv: &str) -> Result<usize> {
        let mut lines = csv.lines().map(str::trim).filter(|l| !l.is_empty());
        let Some(header) = lines.next() else {
            return Ok(0);
        };
        let header = split_record(header);

        let mut rows = Vec::new();
        for (n, line) in lines.enumerate() {
            let fields = split_record(line);
            if fields.len() != header.len() {
                return Err(ExecError::Workload(format!(
                    "simulation {}: row {} of table {} has {} fields, expected {}",
                    simulation,
                    n + 1,
                    table,
                    fields.len(),
                    header.len()
                )));
            }
            rows.push(Row {
                simulation: simulation.to_string(),
                values: header
                    .iter()
                    .cloned()
                    .zip(fields)
                    .collect(),
            });
        }

        let added = rows.len();
        let mut tables = self.tables.write();
        let stored = tables.entry(table.to_string()).or_default();
        for column in header {
            if column != SIMULATION_COLUMN && !stored.columns.contains(&column) {
                stored.columns.push(column);
            }
        }
        stored.rows.extend(rows);
        Ok(added)
    }

    /// Remove every row produced by `simulation`, in all tables.
    pub fn clear_simulation(&self, simulation: &str) {
        let mut tables = self.tables.write();
        for stored in tables.values_mut() {
            stored.rows.retain(|row| row.simulation != simulation);
        }
    }

    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Typed snapshot of a table, with the simulation name as first column.
    pub fn table(&self, name: &str) -> Result<DataTable> {
        let tables = self.tables.read();
        let stored = tables
            .get(name)
            .ok_or_else(|| ExecError::TableNotFound(name.to_string()))?;

        let mut table = DataTable::new(name);
        table.push_column(
            SIMULATION_COLUMN,
            ColumnValues::String(stored.rows.iter().map(|r| r.simulation.clone()).collect()),
        );
        for column in &stored.columns {
            let raw: Vec<&str> = stored
                .rows
                .iter()
                .map(|r| r.values.get(column).map(String::as_str).unwrap_or(""))
                .collect();
            table.push_column(column.as_str(), infer(&raw));
        }
        Ok(table)
    }
}

/// Split one CSV line into trimmed fields, honoring double quotes.
fn split_record(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if quoted && chars.peek() == Some(&'"') => {
                field.push('"');
                chars.next();
            }
            '"' if quoted => quoted = false,
            '"' if field.trim().is_empty() => {
                field.clear();
                quoted = true;
            }
            ',' if !quoted => fields.push(std::mem::take(&mut field).trim().to_string()),
            _ => field.push(c),
        }
    }
    fields.push(field.trim().to_string());
    fields
}

fn infer(raw: &[&str]) -> ColumnValues {
    if raw.is_empty() {
        return ColumnValues::String(Vec::new());
    }
    if let Some(values) = parse_all(raw, |v| v.parse::<i32>().ok()) {
        return ColumnValues::Int32(values);
    }
    if let Some(values) = parse_all(raw, |v| v.parse::<f64>().ok()) {
        return ColumnValues::Double(values);
    }
    if let Some(values) = parse_all(raw, parse_bool) {
        return ColumnValues::Boolean(values);
    }
    if let Some(values) = parse_all(raw, parse_date) {
        return ColumnValues::DateTime(values);
    }
    ColumnValues::String(raw.iter().map(|v| v.to_string()).collect())
}

fn parse_all<T>(raw: &[&str], parse: impl Fn(&str) -> Option<T>) -> Option<Vec<T>> {
    raw.iter().map(|v| parse(v)).collect()
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}

fn parse_date(raw: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S"))
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}
