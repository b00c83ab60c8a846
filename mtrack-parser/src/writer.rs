//! Streaming writer for the JSON artifact.
//!
//! The artifact is one object with three arrays (`events`, `stacks`,
//! `strings`) written strictly in that order, each terminated by a literal
//! `null` sentinel so that consumers can parse incrementally. String values
//! are emitted as-is; inputs are expected to be pre-sanitized. A `.gz`
//! output path wraps the stream in gzip framing.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use flate2::write::GzEncoder;
use flate2::Compression;

enum Sink {
    Plain(BufWriter<File>),
    Gzip(GzEncoder<BufWriter<File>>),
    Buffer(Vec<u8>),
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Sink::Plain(w) => w.write(buf),
            Sink::Gzip(w) => w.write(buf),
            Sink::Buffer(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Sink::Plain(w) => w.flush(),
            Sink::Gzip(w) => w.flush(),
            Sink::Buffer(w) => w.flush(),
        }
    }
}

pub struct ArtifactWriter {
    sink: Sink,
}

impl ArtifactWriter {
    pub fn create(path: &Path, gzip: bool) -> io::Result<ArtifactWriter> {
        let file = BufWriter::new(File::create(path)?);
        let sink = if gzip {
            Sink::Gzip(GzEncoder::new(file, Compression::default()))
        } else {
            Sink::Plain(file)
        };
        Ok(ArtifactWriter { sink })
    }

    /// In-memory writer, used by the tests.
    pub fn buffer() -> ArtifactWriter {
        ArtifactWriter {
            sink: Sink::Buffer(Vec::new()),
        }
    }

    pub fn begin(&mut self) -> io::Result<()> {
        self.sink.write_all(b"{\"events\":[")
    }

    pub fn event(&mut self, tuple: &str) -> io::Result<()> {
        self.sink.write_all(tuple.as_bytes())?;
        self.sink.write_all(b",")
    }

    pub fn finish_events(&mut self) -> io::Result<()> {
        self.sink.write_all(b"null],\n\"stacks\":[")
    }

    pub fn stack_begin(&mut self) -> io::Result<()> {
        self.sink.write_all(b"[")
    }

    pub fn stack_frame(&mut self, frame: &str) -> io::Result<()> {
        self.sink.write_all(frame.as_bytes())?;
        self.sink.write_all(b",")
    }

    pub fn stack_end(&mut self) -> io::Result<()> {
        self.sink.write_all(b"null],")
    }

    pub fn finish_stacks(&mut self) -> io::Result<()> {
        self.sink.write_all(b"null],\n\"strings\":[")
    }

    pub fn string(&mut self, value: &str) -> io::Result<()> {
        self.sink.write_all(b"\"")?;
        self.sink.write_all(value.as_bytes())?;
        self.sink.write_all(b"\",")
    }

    /// Close the object and flush (finishing the gzip stream if any).
    pub fn finish(self) -> io::Result<Option<Vec<u8>>> {
        let mut sink = self.sink;
        sink.write_all(b"null]\n}\n")?;
        match sink {
            Sink::Plain(mut w) => {
                w.flush()?;
                Ok(None)
            }
            Sink::Gzip(w) => {
                let mut inner = w.finish()?;
                inner.flush()?;
                Ok(None)
            }
            Sink::Buffer(data) => Ok(Some(data)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_artifact_is_valid_json() {
        let mut writer = ArtifactWriter::buffer();
        writer.begin().unwrap();
        writer.finish_events().unwrap();
        writer.finish_stacks().unwrap();
        let data = writer.finish().unwrap().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&data).unwrap();
        assert_eq!(json["events"], serde_json::json!([null]));
        assert_eq!(json["stacks"], serde_json::json!([null]));
        assert_eq!(json["strings"], serde_json::json!([null]));
    }

    #[test]
    fn arrays_are_null_terminated() {
        let mut writer = ArtifactWriter::buffer();
        writer.begin().unwrap();
        writer.event("[8,4096]").unwrap();
        writer.finish_events().unwrap();
        writer.stack_begin().unwrap();
        writer.stack_frame("[0,1,10]").unwrap();
        writer.stack_end().unwrap();
        writer.finish_stacks().unwrap();
        writer.string("main").unwrap();
        let data = writer.finish().unwrap().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&data).unwrap();
        assert_eq!(json["events"], serde_json::json!([[8, 4096], null]));
        assert_eq!(json["stacks"], serde_json::json!([[[0, 1, 10], null], null]));
        assert_eq!(json["strings"], serde_json::json!(["main", null]));
    }
}
