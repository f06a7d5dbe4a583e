//! Conversion of delivered columnar files into the row-based ntuple encoding.
//!
//! The ntuple file is line-delimited JSON. The first line is a header naming
//! the container (the variant) and its fields; every following line is one row.

use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, AsArray, ListArray, StructArray};
use arrow::compute::concat_batches;
use arrow::datatypes::{DataType, Field, Fields, Schema};
use arrow::error::ArrowError;
use arrow::json::LineDelimitedWriter;
use arrow::record_batch::RecordBatch;
use camino::Utf8Path;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use serde::Serialize;
use tracing::debug;

use crate::error::BinderError;

pub const NTUPLE_EXTENSION: &str = "ntuple.jsonl";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscodeOutcome {
    Written { rows: u64 },
    /// The source had no rows; nothing was written.
    Elided,
}

pub trait Transcoder: Send + Sync {
    /// Suffix appended to the stem of every file this transcoder writes.
    fn extension(&self) -> &'static str;

    fn row_count(&self, source: &Utf8Path) -> Result<u64, BinderError>;

    fn transcode(
        &self,
        container: &str,
        source: &Utf8Path,
        destination: &Utf8Path,
    ) -> Result<TranscodeOutcome, BinderError>;
}

#[derive(Debug, Clone, Default)]
pub struct ParquetToNtuple {
    zip_vector_columns: bool,
}

#[derive(Debug, Serialize)]
struct NtupleHeader<'a> {
    container: &'a str,
    fields: Vec<String>,
    rows: u64,
}

impl ParquetToNtuple {
    pub fn new(zip_vector_columns: bool) -> Self {
        Self { zip_vector_columns }
    }
}

impl Transcoder for ParquetToNtuple {
    fn extension(&self) -> &'static str {
        NTUPLE_EXTENSION
    }

    fn row_count(&self, source: &Utf8Path) -> Result<u64, BinderError> {
        parquet_row_count(source)
    }

    fn transcode(
        &self,
        container: &str,
        source: &Utf8Path,
        destination: &Utf8Path,
    ) -> Result<TranscodeOutcome, BinderError> {
        if self.row_count(source)? == 0 {
            debug!(source = %source, "empty source, nothing written");
            return Ok(TranscodeOutcome::Elided);
        }

        let builder = open_reader(source)?;
        let schema = builder.schema().clone();
        let reader = builder
            .build()
            .map_err(|err| BinderError::Transcode(format!("read {source}: {err}")))?;
        let batches = reader
            .collect::<Result<Vec<_>, ArrowError>>()
            .map_err(|err| BinderError::Transcode(format!("decode {source}: {err}")))?;
        let mut batch = concat_batches(&schema, &batches)
            .map_err(|err| BinderError::Transcode(err.to_string()))?;
        if self.zip_vector_columns {
            batch = zip_vector_columns(batch)
                .map_err(|err| BinderError::Transcode(format!("zip columns: {err}")))?;
        }

        write_ntuple(container, &batch, destination)?;
        Ok(TranscodeOutcome::Written {
            rows: batch.num_rows() as u64,
        })
    }
}

/// Row count recorded in a Parquet footer. Only the metadata is read.
pub fn parquet_row_count(source: &Utf8Path) -> Result<u64, BinderError> {
    let builder = open_reader(source)?;
    Ok(u64::try_from(builder.metadata().file_metadata().num_rows()).unwrap_or(0))
}

fn open_reader(source: &Utf8Path) -> Result<ParquetRecordBatchReaderBuilder<File>, BinderError> {
    let file = File::open(source.as_std_path())
        .map_err(|err| BinderError::Transcode(format!("open {source}: {err}")))?;
    ParquetRecordBatchReaderBuilder::try_new(file)
        .map_err(|err| BinderError::Transcode(format!("read {source}: {err}")))
}

fn write_ntuple(
    container: &str,
    batch: &RecordBatch,
    destination: &Utf8Path,
) -> Result<(), BinderError> {
    let parent = destination
        .parent()
        .ok_or_else(|| BinderError::Transcode(format!("invalid destination {destination}")))?;
    let mut temp = tempfile::Builder::new()
        .prefix(".databinder")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| BinderError::Transcode(err.to_string()))?;

    let header = NtupleHeader {
        container,
        fields: batch
            .schema()
            .fields()
            .iter()
            .map(|field| field.name().clone())
            .collect(),
        rows: batch.num_rows() as u64,
    };

    {
        let mut out = BufWriter::new(temp.as_file_mut());
        serde_json::to_writer(&mut out, &header)
            .map_err(|err| BinderError::Transcode(err.to_string()))?;
        out.write_all(b"\n")
            .map_err(|err| BinderError::Transcode(err.to_string()))?;
        let mut writer = LineDelimitedWriter::new(&mut out);
        writer
            .write(batch)
            .map_err(|err| BinderError::Transcode(err.to_string()))?;
        writer
            .finish()
            .map_err(|err| BinderError::Transcode(err.to_string()))?;
        drop(writer);
        out.flush()
            .map_err(|err| BinderError::Transcode(err.to_string()))?;
    }

    temp.persist(destination.as_std_path())
        .map_err(|err| BinderError::Transcode(err.error.to_string()))?;
    Ok(())
}

/// Merge list columns named `prefix_suffix` that share a prefix and have
/// identical offsets into one `prefix: list<struct<suffix...>>` column.
/// Groups whose offsets differ are left as separate columns.
pub fn zip_vector_columns(batch: RecordBatch) -> Result<RecordBatch, ArrowError> {
    let schema = batch.schema();

    let mut groups: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for (idx, field) in schema.fields().iter().enumerate() {
        if !matches!(field.data_type(), DataType::List(_)) {
            continue;
        }
        if let Some((prefix, suffix)) = field.name().split_once('_') {
            if !prefix.is_empty() && !suffix.is_empty() {
                groups.entry(prefix.to_string()).or_default().push(idx);
            }
        }
    }

    let mut zipped: BTreeMap<usize, (Field, ArrayRef)> = BTreeMap::new();
    let mut consumed = HashSet::new();
    for (prefix, members) in groups {
        if members.len() < 2 || schema.field_with_name(&prefix).is_ok() {
            continue;
        }
        let lists: Vec<&ListArray> = members
            .iter()
            .map(|&idx| batch.column(idx).as_list::<i32>())
            .collect();
        let first = lists[0];
        let aligned = lists.iter().all(|list| {
            list.value_offsets() == first.value_offsets()
                && list.nulls() == first.nulls()
                && list.values().len() == first.values().len()
        });
        if !aligned {
            continue;
        }

        let struct_fields: Fields = members
            .iter()
            .zip(&lists)
            .map(|(&idx, list)| {
                let suffix = schema
                    .field(idx)
                    .name()
                    .split_once('_')
                    .map(|(_, suffix)| suffix)
                    .unwrap_or_default();
                Field::new(suffix, list.values().data_type().clone(), true)
            })
            .collect();
        let values = StructArray::try_new(
            struct_fields.clone(),
            lists.iter().map(|list| list.values().clone()).collect(),
            None,
        )?;
        let item = Arc::new(Field::new("item", DataType::Struct(struct_fields), true));
        let list = ListArray::try_new(
            item.clone(),
            first.offsets().clone(),
            Arc::new(values),
            first.nulls().cloned(),
        )?;

        zipped.insert(
            members[0],
            (Field::new(&prefix, DataType::List(item), true), Arc::new(list)),
        );
        consumed.extend(members);
    }

    if zipped.is_empty() {
        return Ok(batch);
    }

    let mut fields = Vec::with_capacity(batch.num_columns());
    let mut columns = Vec::with_capacity(batch.num_columns());
    for idx in 0..batch.num_columns() {
        if let Some((field, column)) = zipped.remove(&idx) {
            fields.push(field);
            columns.push(column);
        } else if !consumed.contains(&idx) {
            fields.push(schema.field(idx).clone());
            columns.push(batch.column(idx).clone());
        }
    }
    RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)
}
