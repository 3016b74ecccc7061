//! The `seed` command: append documents to a spool topic.

use std::io::BufRead;
use std::path::PathBuf;

use anyhow::Context;
use chrono::Utc;

use crate::models::{
    Headers, HEADER_COMMIT_SHA, HEADER_FILE_PATH, HEADER_REPOSITORY, HEADER_SOURCE_TYPE,
};
use crate::spool::{self, SpoolRecord};

#[derive(clap::Args, Debug)]
pub struct SeedArgs {
    /// Spool root directory
    #[arg(long, env = "SPOOL_DIR", default_value = "./spool")]
    spool_dir: PathBuf,

    /// Topic to append to
    #[arg(long, env = "SOURCE_TOPIC", default_value = "documents.raw")]
    topic: String,

    /// Partition to append to
    #[arg(long, default_value_t = 0)]
    partition: i32,

    /// Repository identifier stamped on each record
    #[arg(long)]
    repository: Option<String>,

    /// Commit the documents were captured at
    #[arg(long)]
    commit_sha: Option<String>,

    /// Document kind stamped on each record
    #[arg(long, default_value = "source_code")]
    source_type: String,

    /// Files to append, one record each. With no files, one record is read
    /// per non-empty stdin line.
    files: Vec<PathBuf>,
}

impl SeedArgs {
    fn headers(&self, file_path: Option<&str>) -> Headers {
        let mut headers = Headers::new();
        if let Some(file_path) = file_path {
            headers.insert(HEADER_FILE_PATH.to_string(), file_path.to_string());
        }
        headers.insert(HEADER_SOURCE_TYPE.to_string(), self.source_type.clone());
        if let Some(repository) = &self.repository {
            headers.insert(HEADER_REPOSITORY.to_string(), repository.clone());
        }
        if let Some(commit_sha) = &self.commit_sha {
            headers.insert(HEADER_COMMIT_SHA.to_string(), commit_sha.clone());
        }
        headers
    }
}

pub async fn seed(args: SeedArgs) -> anyhow::Result<()> {
    let appended = if args.files.is_empty() {
        seed_from_stdin(&args)?
    } else {
        seed_from_files(&args)?
    };

    println!(
        "appended {appended} record(s) to {}:{}",
        args.topic, args.partition
    );
    Ok(())
}

fn seed_from_files(args: &SeedArgs) -> anyhow::Result<usize> {
    for path in &args.files {
        let value =
            std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        let file_path = path.display().to_string();

        // Key by repository-qualified path so re-seeding the same document
        // dedups instead of reprocessing.
        let key = match &args.repository {
            Some(repository) => format!("{repository}/{file_path}"),
            None => file_path.clone(),
        };

        let record = SpoolRecord::from_parts(
            key.as_bytes(),
            &value,
            args.headers(Some(&file_path)),
            Utc::now(),
        );
        spool::append(&args.spool_dir, &args.topic, args.partition, &record)?;
    }
    Ok(args.files.len())
}

/// One record per non-empty stdin line. Lines carry no file path and an
/// empty key, so dedup falls back to the record's origin coordinates.
fn seed_from_stdin(args: &SeedArgs) -> anyhow::Result<usize> {
    let stdin = std::io::stdin();
    let mut appended = 0;
    for line in stdin.lock().lines() {
        let line = line.context("reading stdin")?;
        if line.trim().is_empty() {
            continue;
        }
        let record = SpoolRecord::from_parts(b"", line.as_bytes(), args.headers(None), Utc::now());
        spool::append(&args.spool_dir, &args.topic, args.partition, &record)?;
        appended += 1;
    }
    Ok(appended)
}
