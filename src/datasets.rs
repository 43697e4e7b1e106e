//! Reading interaction logs and writing result tables as CSV.
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use serde::Serialize;

use crate::data::{Interaction, Interactions};
use crate::evaluation::{ResultTable, RowStatus};

/// Dataset error types.
#[derive(Debug, Fail)]
pub enum DatasetError {
    /// The file has a header but no rows.
    #[fail(display = "No interactions found in {}.", _0)]
    Empty(String),
}

/// Read `user_id,item_id,timestamp[,value]` rows from a CSV reader.
///
/// A missing `value` column means implicit feedback with a value of 1.0.
pub fn read_csv<R: Read>(reader: R) -> Result<Interactions, failure::Error> {
    let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
    let interactions: Vec<Interaction> = reader.deserialize().collect::<Result<Vec<_>, _>>()?;

    Ok(Interactions::new(interactions)?)
}

/// Load an interaction log from a CSV file.
pub fn load_csv<P: AsRef<Path>>(path: P) -> Result<Interactions, failure::Error> {
    let path = path.as_ref();
    let interactions = read_csv(File::open(path)?)?;

    if interactions.is_empty() {
        return Err(DatasetError::Empty(path.display().to_string()).into());
    }

    Ok(interactions)
}

#[derive(Serialize)]
struct ResultRecord<'a> {
    model_name: &'a str,
    k: Option<usize>,
    metric_name: Option<&'a str>,
    relevance_threshold: Option<f32>,
    value: Option<f64>,
    status: &'a str,
    error_kind: Option<&'a str>,
    error_message: Option<&'a str>,
}

/// Write a result table as CSV.
pub fn write_results<W: Write>(writer: W, table: &ResultTable) -> Result<(), failure::Error> {
    let mut writer = csv::Writer::from_writer(writer);

    for row in table.rows() {
        let (status, error_kind, error_message) = match &row.status {
            RowStatus::Ok => ("ok", None, None),
            RowStatus::NoData => ("no_data", None, None),
            RowStatus::Failed { kind, message } => {
                ("failed", Some(kind.as_str()), Some(message.as_str()))
            }
        };

        writer.serialize(ResultRecord {
            model_name: &row.model_name,
            k: row.k,
            metric_name: row.metric_name.as_ref().map(String::as_str),
            relevance_threshold: row.relevance_threshold,
            value: row.value,
            status,
            error_kind,
            error_message,
        })?;
    }

    writer.flush()?;

    Ok(())
}

/// Write a result table to a CSV file.
pub fn write_results_csv<P: AsRef<Path>>(path: P, table: &ResultTable) -> Result<(), failure::Error> {
    write_results(File::create(path)?, table)
}
