use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use anyhow::{Context, Result};
use indexmap::IndexMap;
use tracing::{debug, warn};

/// One CSV row keyed by the header row.
pub type Record = IndexMap<String, String>;

/// Streams records from CSV input. The first row is the header; rows with fewer fields than
/// the header are skipped, extra trailing fields are ignored.
pub struct Records<R> {
    reader: csv::Reader<R>,
    headers: Vec<String>,
    row: csv::StringRecord,
    skipped: usize,
}

impl<R: Read> Records<R> {
    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    /// Short rows skipped so far.
    pub fn skipped(&self) -> usize {
        self.skipped
    }
}

impl<R: Read> Iterator for Records<R> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.reader.read_record(&mut self.row) {
                Ok(false) => return None,
                Ok(true) => {}
                Err(err) => return Some(Err(err).context("reading csv row")),
            }

            if self.row.len() < self.headers.len() {
                self.skipped += 1;
                debug!(
                    target: "import",
                    line = self.row.position().map(|p| p.line()),
                    fields = self.row.len(),
                    expected = self.headers.len(),
                    "skipping short row"
                );
                continue;
            }

            let record = self
                .headers
                .iter()
                .cloned()
                .zip(self.row.iter().map(str::to_string))
                .collect();
            return Some(Ok(record));
        }
    }
}

pub fn read_records<R: Read>(reader: R) -> Result<Records<R>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(reader);
    let headers = reader
        .headers()
        .context("reading csv header")?
        .iter()
        .map(str::to_string)
        .collect();

    Ok(Records {
        reader,
        headers,
        row: csv::StringRecord::new(),
        skipped: 0,
    })
}

/// Opens a CSV file; a missing file reads as an empty source.
pub fn open_records(path: &Path) -> Result<Records<Box<dyn Read>>> {
    let input: Box<dyn Read> = match File::open(path) {
        Ok(file) => Box::new(BufReader::new(file)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            warn!(
                target: "import",
                path = %path.display(),
                "data file not found, nothing to import"
            );
            Box::new(io::empty())
        }
        Err(err) => return Err(err).with_context(|| format!("opening {}", path.display())),
    };
    read_records(input)
}
