use std::fs;
use std::io::{BufWriter, Seek, Write};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{Local, NaiveDateTime, Timelike};
use tempfile::Builder;
use tracing::info;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::biom::{BiomOptions, Fragment, generate_biom_file};
use crate::error::OtuError;
use crate::query::SampleQuery;

pub fn local_now() -> NaiveDateTime {
    let now = Local::now().naive_local();
    now.with_nanosecond(0).unwrap_or(now)
}

pub fn make_timestamp(at: NaiveDateTime) -> String {
    at.format("%Y-%m-%dT%H%M%S").to_string()
}

pub fn biom_entry_name(timestamp: &str) -> String {
    format!("BiomExport-{timestamp}.biom")
}

pub fn biom_archive_name(timestamp: &str) -> String {
    format!("{}.zip", biom_entry_name(timestamp))
}

pub fn write_biom_zip<W, I>(writer: W, entry: &str, fragments: I) -> Result<(W, u64), OtuError>
where
    W: Write + Seek,
    I: Iterator<Item = Fragment>,
{
    let mut zip = ZipWriter::new(writer);
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .large_file(true);
    zip.start_file(entry, options)
        .map_err(|err| OtuError::Export(err.to_string()))?;
    let mut size = 0_u64;
    for fragment in fragments {
        let fragment = fragment?;
        zip.write_all(fragment.as_bytes())
            .map_err(|err| OtuError::Export(err.to_string()))?;
        size += fragment.len() as u64;
    }
    let writer = zip
        .finish()
        .map_err(|err| OtuError::Export(err.to_string()))?;
    Ok((writer, size))
}

pub fn save_biom_zip_file(
    query: &SampleQuery<'_>,
    dir: &Utf8Path,
    options: &BiomOptions,
) -> Result<Utf8PathBuf, OtuError> {
    let timestamp = make_timestamp(options.date);
    let path = dir.join(biom_archive_name(&timestamp));
    fs::create_dir_all(dir.as_std_path()).map_err(|err| OtuError::Filesystem(err.to_string()))?;
    info!(path = %path, "writing BIOM export");

    let temp = Builder::new()
        .prefix(".biom-export")
        .suffix(".partial")
        .tempfile_in(dir.as_std_path())
        .map_err(|err| OtuError::Filesystem(err.to_string()))?;
    let (writer, size) = write_biom_zip(
        BufWriter::new(temp.as_file()),
        &biom_entry_name(&timestamp),
        generate_biom_file(query, options),
    )?;
    writer
        .into_inner()
        .map_err(|err| OtuError::Filesystem(err.to_string()))?;
    temp.as_file()
        .sync_all()
        .map_err(|err| OtuError::Filesystem(err.to_string()))?;
    temp.persist(path.as_std_path())
        .map_err(|err| OtuError::Filesystem(err.to_string()))?;

    info!(path = %path, bytes = size, "BIOM export complete");
    Ok(path)
}

pub fn biom_stream_size(query: &SampleQuery<'_>, options: &BiomOptions) -> Result<u64, OtuError> {
    let mut size = 0_u64;
    for fragment in generate_biom_file(query, options) {
        size += fragment?.len() as u64;
    }
    Ok(size)
}
