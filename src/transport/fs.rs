use std::fs::File;
use std::io::{self, BufRead, BufReader, Cursor, Read};
use std::path::{Path, PathBuf};

use tracing::warn;
use walkdir::WalkDir;

use crate::constants::reader::TEXT_FILE_EXTENSION;
use crate::errors::PipelineError;
use crate::normalize::decode;

const UTF16_LE_BOM: [u8; 2] = [0xFF, 0xFE];
const UTF16_BE_BOM: [u8; 2] = [0xFE, 0xFF];

/// Non-blank lines of a file as raw bytes, numbered from 1.
///
/// Bytes are not decoded here; decoding belongs to the normalizer. The one
/// exception is a file starting with a UTF-16 byte-order mark: it is decoded
/// whole at open and streamed as UTF-8 lines, since its newlines are not
/// single `0x0A` bytes. The stream ends after the first read error, which is
/// yielded once.
pub struct LineStream {
    reader: Box<dyn BufRead + Send>,
    path: PathBuf,
    line_no: usize,
    done: bool,
}

impl LineStream {
    /// Open `path` for line streaming.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, PipelineError> {
        let path = path.into();
        let file = File::open(&path).map_err(|err| {
            PipelineError::format(path.display(), format!("cannot open input: {err}"))
        })?;
        let mut reader = BufReader::new(file);
        let head = reader.fill_buf().map_err(|err| {
            PipelineError::format(path.display(), format!("cannot read input: {err}"))
        })?;
        let reader: Box<dyn BufRead + Send> =
            if head.starts_with(&UTF16_LE_BOM) || head.starts_with(&UTF16_BE_BOM) {
                Box::new(Cursor::new(transcode_utf16(&path, reader)?))
            } else {
                Box::new(reader)
            };
        Ok(Self {
            reader,
            path,
            line_no: 0,
            done: false,
        })
    }

    /// Path being streamed.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Iterator for LineStream {
    type Item = Result<(usize, Vec<u8>), PipelineError>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            let mut buf = Vec::new();
            match self.reader.read_until(b'\n', &mut buf) {
                Ok(0) => self.done = true,
                Ok(_) => {
                    self.line_no += 1;
                    while matches!(buf.last(), Some(b'\n' | b'\r')) {
                        buf.pop();
                    }
                    if buf.iter().all(u8::is_ascii_whitespace) {
                        continue;
                    }
                    return Some(Ok((self.line_no, buf)));
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    self.done = true;
                    return Some(Err(PipelineError::format(
                        format!("{}:{}", self.path.display(), self.line_no + 1),
                        format!("read failed: {err}"),
                    )));
                }
            }
        }
        None
    }
}

fn transcode_utf16(path: &Path, mut reader: BufReader<File>) -> Result<Vec<u8>, PipelineError> {
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes).map_err(|err| {
        PipelineError::format(path.display(), format!("cannot read input: {err}"))
    })?;
    decode(&bytes)
        .map(|decoded| decoded.text.into_bytes())
        .map_err(|reason| PipelineError::format(path.display(), reason))
}

/// Deterministically ordered text files under `root` (or `root` itself when it is a file).
pub fn list_text_files(root: &Path, follow_links: bool) -> Result<Vec<PathBuf>, PipelineError> {
    if root.is_file() {
        return Ok(vec![root.to_path_buf()]);
    }
    if !root.is_dir() {
        return Err(PipelineError::format(
            root.display(),
            "input path does not exist",
        ));
    }
    let mut paths = Vec::new();
    for entry in WalkDir::new(root).follow_links(follow_links) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(root = %root.display(), error = %err, "skipping unreadable directory entry");
                continue;
            }
        };
        if entry.file_type().is_file() && is_text_file(entry.path()) {
            paths.push(entry.into_path());
        }
    }
    paths.sort();
    Ok(paths)
}

/// True if the path has a `.txt` extension (case-insensitive).
pub fn is_text_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case(TEXT_FILE_EXTENSION))
        .unwrap_or(false)
}

/// Root-relative path with `/` separators, used as a stable source id.
pub fn relative_id(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    let parts: Vec<String> = relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        return file_stem(path);
    }
    parts.join("/")
}

/// File stem used as the prefix of line-derived source ids.
pub fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "input".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn line_stream_skips_blank_lines_and_keeps_numbers() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("corpus.txt");
        fs::write(&path, b"first\r\n\n   \nsecond\nthird").unwrap();

        let lines: Vec<(usize, Vec<u8>)> = LineStream::open(&path)
            .unwrap()
            .map(Result::unwrap)
            .collect();
        assert_eq!(
            lines,
            vec![
                (1, b"first".to_vec()),
                (4, b"second".to_vec()),
                (5, b"third".to_vec()),
            ]
        );
    }

    #[test]
    fn line_stream_passes_invalid_utf8_through() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("bytes.txt");
        fs::write(&path, [0xc3, 0x28, b'x', b'\n']).unwrap();
        let lines: Vec<_> = LineStream::open(&path).unwrap().collect();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].as_ref().unwrap().1, vec![0xc3, 0x28, b'x']);
    }

    #[test]
    fn line_stream_splits_utf16_input_on_decoded_newlines() {
        let temp = tempdir().unwrap();
        for (name, bom, encode) in [
            ("le.txt", UTF16_LE_BOM, u16::to_le_bytes as fn(u16) -> [u8; 2]),
            ("be.txt", UTF16_BE_BOM, u16::to_be_bytes as fn(u16) -> [u8; 2]),
        ] {
            let path = temp.path().join(name);
            let mut bytes = bom.to_vec();
            for unit in "안녕.\nHello.\n".encode_utf16() {
                bytes.extend_from_slice(&encode(unit));
            }
            fs::write(&path, bytes).unwrap();

            let lines: Vec<(usize, Vec<u8>)> = LineStream::open(&path)
                .unwrap()
                .map(Result::unwrap)
                .collect();
            assert_eq!(
                lines,
                vec![(1, "안녕.".as_bytes().to_vec()), (2, b"Hello.".to_vec())]
            );
        }
    }

    #[test]
    fn list_text_files_is_sorted_and_filtered() {
        let temp = tempdir().unwrap();
        let root = temp.path();
        fs::create_dir_all(root.join("ko")).unwrap();
        fs::write(root.join("ko/b.txt"), "b").unwrap();
        fs::write(root.join("a.TXT"), "a").unwrap();
        fs::write(root.join("skip.json"), "{}").unwrap();

        let files = list_text_files(root, false).unwrap();
        let ids: Vec<String> = files.iter().map(|path| relative_id(root, path)).collect();
        assert_eq!(ids, vec!["a.TXT".to_string(), "ko/b.txt".to_string()]);
    }

    #[test]
    fn list_text_files_rejects_missing_root() {
        let temp = tempdir().unwrap();
        let missing = temp.path().join("missing");
        assert!(matches!(
            list_text_files(&missing, false),
            Err(PipelineError::Format { .. })
        ));
    }
}
