use std::{
    fs::{self, File},
    io::{self, BufWriter, Write},
    path::Path,
};

pub const DELIMITER: &str = "~|~";

/// Streaming writer for `~|~`-delimited rows.
///
/// Fields are written verbatim. The delimiter is never escaped, so a field
/// containing the literal `~|~` sequence corrupts its row; callers accept
/// that as a limitation of the format.
pub struct DelimitedWriter<W: Write> {
    out: W,
}

impl DelimitedWriter<BufWriter<File>> {
    /// Create the file at `path`, creating its parent directory if absent.
    pub fn create(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(Self::new(BufWriter::new(File::create(path)?)))
    }
}

impl<W: Write> DelimitedWriter<W> {
    pub const fn new(out: W) -> Self {
        Self { out }
    }

    /// Write one row and flush it, so a crash mid-run loses no finished rows.
    pub fn write_row<'a, I>(&mut self, fields: I) -> io::Result<()>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut first = true;
        for field in fields {
            if !first {
                self.out.write_all(DELIMITER.as_bytes())?;
            }
            self.out.write_all(field.as_bytes())?;
            first = false;
        }
        self.out.write_all(b"\n")?;
        self.out.flush()
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

/// Split one written row back into its fields.
pub fn split_row(line: &str) -> impl Iterator<Item = &str> {
    line.split(DELIMITER)
}
