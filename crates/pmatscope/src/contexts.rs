//! The call-context stack recorded at the tail of a dump.
//!
//! A small trailing section records the interpreter's call contexts at dump
//! time: subroutine calls, eval blocks, and string evals, innermost first.
//! Decoding stops at the zero tag; a dump with no trailing section at all is
//! valid.

use crate::{
    error::{PmatError, PmatResult},
    format::ctx,
    reader::PmatReader,
    sv::Addr,
};

/// Calling convention of a context frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, serde::Serialize)]
#[strum(serialize_all = "lowercase")]
pub enum Gimme {
    Void,
    Scalar,
    Array,
}

impl Gimme {
    fn from_byte(byte: u8, position: u64) -> PmatResult<Self> {
        Ok(match byte {
            0 => Self::Void,
            1 => Self::Scalar,
            2 => Self::Array,
            tag => return Err(PmatError::UnknownTag { tag, position }),
        })
    }
}

/// One call-context frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Context {
    /// A subroutine call.
    Sub {
        gimme: Gimme,
        file: Option<String>,
        line: u64,
        /// The called code object.
        cv: Addr,
        /// The arguments array, or zero when none was captured.
        args: Addr,
    },
    /// An eval-block.
    Try {
        gimme: Gimme,
        file: Option<String>,
        line: u64,
    },
    /// A string eval.
    Eval {
        gimme: Gimme,
        file: Option<String>,
        line: u64,
        /// The scalar holding the source text.
        source: Addr,
    },
}

impl Context {
    /// The frame's calling convention.
    #[must_use]
    pub fn gimme(&self) -> Gimme {
        match self {
            Self::Sub { gimme, .. } | Self::Try { gimme, .. } | Self::Eval { gimme, .. } => *gimme,
        }
    }

    /// The source file the frame was entered from.
    #[must_use]
    pub fn file(&self) -> Option<&str> {
        match self {
            Self::Sub { file, .. } | Self::Try { file, .. } | Self::Eval { file, .. } => {
                file.as_deref()
            }
        }
    }

    /// The source line the frame was entered from.
    #[must_use]
    pub fn line(&self) -> u64 {
        match self {
            Self::Sub { line, .. } | Self::Try { line, .. } | Self::Eval { line, .. } => *line,
        }
    }

    /// A short name for the frame type.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Sub { .. } => "SUB",
            Self::Try { .. } => "TRY",
            Self::Eval { .. } => "EVAL",
        }
    }
}

/// Decodes the trailing context section, if the stream has one.
pub(crate) fn read_contexts<R: std::io::Read>(
    reader: &mut PmatReader<R>,
) -> PmatResult<Vec<Context>> {
    let mut contexts = Vec::new();
    loop {
        // The section is optional: clean EOF here means "no more frames".
        let tag_position = reader.position();
        let Some(tag) = reader.try_read_u8()? else {
            break;
        };
        if tag == 0 {
            break;
        }
        let gimme_position = reader.position();
        contexts.push(match tag {
            ctx::SUB => {
                let gimme = Gimme::from_byte(reader.read_u8()?, gimme_position)?;
                let file = read_lossy_str(reader)?;
                let line = reader.read_uint()?;
                let cv = reader.read_ptr()?;
                let args = reader.read_ptr()?;
                Context::Sub {
                    gimme,
                    file,
                    line,
                    cv,
                    args,
                }
            }
            ctx::TRY => {
                let gimme = Gimme::from_byte(reader.read_u8()?, gimme_position)?;
                let file = read_lossy_str(reader)?;
                let line = reader.read_uint()?;
                Context::Try { gimme, file, line }
            }
            ctx::EVAL => {
                let gimme = Gimme::from_byte(reader.read_u8()?, gimme_position)?;
                let file = read_lossy_str(reader)?;
                let line = reader.read_uint()?;
                let source = reader.read_ptr()?;
                Context::Eval {
                    gimme,
                    file,
                    line,
                    source,
                }
            }
            tag => {
                return Err(PmatError::UnknownTag {
                    tag,
                    position: tag_position,
                });
            }
        });
    }
    Ok(contexts)
}

fn read_lossy_str<R: std::io::Read>(reader: &mut PmatReader<R>) -> PmatResult<Option<String>> {
    Ok(reader
        .read_str()?
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
}
