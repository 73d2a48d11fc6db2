use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use std::fmt;
use std::fs::File;
use std::io::{self, Read};

/// A source of client addresses: a file or stdin.
#[derive(Default, Clone, Debug, PartialEq, Eq)]
pub enum FileOrStdin {
    File(Utf8PathBuf),
    #[default]
    Stdin,
}

impl fmt::Display for FileOrStdin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileOrStdin::File(path) => write!(f, "{}", path),
            FileOrStdin::Stdin => write!(f, "<stdin>"),
        }
    }
}

impl FileOrStdin {
    /// `-` means stdin.
    pub fn from_path(path: Utf8PathBuf) -> Self {
        if path.as_str() == "-" {
            FileOrStdin::Stdin
        } else {
            FileOrStdin::File(path)
        }
    }

    /// Open the source for reading.
    pub fn reader(&self) -> Result<InputReader> {
        match self {
            FileOrStdin::File(path) => {
                let file =
                    File::open(path).with_context(|| format!("failed to open file: {}", path))?;
                Ok(InputReader::File(file))
            }
            FileOrStdin::Stdin => Ok(InputReader::Stdin(io::stdin())),
        }
    }
}

/// An open [`FileOrStdin`]. Unbuffered; callers read it through a line buffer.
pub enum InputReader {
    File(File),
    Stdin(io::Stdin),
}

impl Read for InputReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            InputReader::File(file) => file.read(buf),
            InputReader::Stdin(stdin) => stdin.read(buf),
        }
    }
}
