use std::borrow::Cow;
use std::fmt;

use crate::config::AppConfig;

pub const DEFAULT_MAX_PAYLOAD_SIZE_BYTES: usize = 8 * 1024 * 1024;
pub const FRAME_HEADER_SIZE_BYTES: usize = 12;
pub const REQUEST_MAGIC: [u8; 4] = *b"\0REQ";
pub const RESPONSE_MAGIC: [u8; 4] = *b"\0RES";

const FIELD_SEPARATOR: u8 = 0;

/// Direction marker carried in the first four bytes of every frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Magic {
    Request,
    Response,
}

impl Magic {
    pub fn bytes(self) -> [u8; 4] {
        match self {
            Self::Request => REQUEST_MAGIC,
            Self::Response => RESPONSE_MAGIC,
        }
    }

    fn from_bytes(bytes: [u8; 4]) -> Option<Self> {
        match bytes {
            REQUEST_MAGIC => Some(Self::Request),
            RESPONSE_MAGIC => Some(Self::Response),
            _ => None,
        }
    }
}

impl fmt::Display for Magic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Request => write!(f, "REQ"),
            Self::Response => write!(f, "RES"),
        }
    }
}

macro_rules! command_types {
    ($($variant:ident = $code:literal, $name:literal, $fields:literal;)+) => {
        /// Every command type understood by the codec, with its wire code.
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        pub enum CommandType {
            $($variant,)+
        }

        impl CommandType {
            pub const ALL: &'static [CommandType] = &[$(CommandType::$variant,)+];

            pub fn code(self) -> u32 {
                match self {
                    $(Self::$variant => $code,)+
                }
            }

            pub fn from_code(code: u32) -> Option<Self> {
                match code {
                    $($code => Some(Self::$variant),)+
                    _ => None,
                }
            }

            pub fn name(self) -> &'static str {
                match self {
                    $(Self::$variant => $name,)+
                }
            }

            /// Number of NUL-separated payload fields; the last one is opaque.
            pub fn field_count(self) -> usize {
                match self {
                    $(Self::$variant => $fields,)+
                }
            }
        }
    };
}

command_types! {
    CanDo = 1, "can_do", 1;
    CantDo = 2, "cant_do", 1;
    ResetAbilities = 3, "reset_abilities", 0;
    PreSleep = 4, "pre_sleep", 0;
    Noop = 6, "noop", 0;
    SubmitJob = 7, "submit_job", 3;
    JobCreated = 8, "job_created", 1;
    GrabJob = 9, "grab_job", 0;
    NoJob = 10, "no_job", 0;
    JobAssign = 11, "job_assign", 3;
    WorkStatus = 12, "work_status", 3;
    WorkComplete = 13, "work_complete", 2;
    WorkFail = 14, "work_fail", 1;
    GetStatus = 15, "get_status", 1;
    EchoReq = 16, "echo_req", 1;
    EchoRes = 17, "echo_res", 1;
    SubmitJobBg = 18, "submit_job_bg", 3;
    Error = 19, "error", 2;
    StatusRes = 20, "status_res", 5;
    SubmitJobHigh = 21, "submit_job_high", 3;
    SetClientId = 22, "set_client_id", 1;
    CanDoTimeout = 23, "can_do_timeout", 2;
    AllYours = 24, "all_yours", 0;
    WorkException = 25, "work_exception", 2;
    OptionReq = 26, "option_req", 1;
    OptionRes = 27, "option_res", 1;
    WorkData = 28, "work_data", 2;
    WorkWarning = 29, "work_warning", 2;
    GrabJobUniq = 30, "grab_job_uniq", 0;
    JobAssignUniq = 31, "job_assign_uniq", 4;
    SubmitJobHighBg = 32, "submit_job_high_bg", 3;
    SubmitJobLow = 33, "submit_job_low", 3;
    SubmitJobLowBg = 34, "submit_job_low_bg", 3;
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    pub magic: Magic,
    pub command: CommandType,
    pub fields: Vec<Vec<u8>>,
}

impl Packet {
    pub fn field(&self, index: usize) -> &[u8] {
        self.fields.get(index).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn field_str(&self, index: usize) -> Cow<'_, str> {
        String::from_utf8_lossy(self.field(index))
    }

    pub fn into_fields(self) -> Vec<Vec<u8>> {
        self.fields
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Decoded {
    Complete { packet: Packet, consumed: usize },
    Incomplete,
}

#[derive(Debug, PartialEq, Eq)]
pub enum CodecError {
    InvalidMagic { expected: Magic, actual: [u8; 4] },
    UnknownCommand { code: u32 },
    PayloadTooLarge { size: usize, limit: usize },
    FieldCountMismatch {
        command: CommandType,
        expected: usize,
        actual: usize,
    },
    SeparatorInField { command: CommandType, index: usize },
    InvalidMaxPayloadSize,
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidMagic { expected, actual } => write!(
                f,
                "frame magic {:?} does not match expected {expected} marker",
                String::from_utf8_lossy(actual)
            ),
            Self::UnknownCommand { code } => write!(f, "unknown command code {code}"),
            Self::PayloadTooLarge { size, limit } => {
                write!(f, "payload size {size} exceeds limit {limit}")
            }
            Self::FieldCountMismatch {
                command,
                expected,
                actual,
            } => write!(
                f,
                "command {command} carries {expected} fields, got {actual}"
            ),
            Self::SeparatorInField { command, index } => write!(
                f,
                "field #{index} of command {command} contains a NUL byte"
            ),
            Self::InvalidMaxPayloadSize => {
                write!(f, "wire.max_payload_size_bytes must be greater than zero")
            }
        }
    }
}

impl std::error::Error for CodecError {}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WireCodec {
    max_payload_size_bytes: usize,
}

impl Default for WireCodec {
    fn default() -> Self {
        Self {
            max_payload_size_bytes: DEFAULT_MAX_PAYLOAD_SIZE_BYTES,
        }
    }
}

impl WireCodec {
    pub fn new(max_payload_size_bytes: usize) -> Result<Self, CodecError> {
        if max_payload_size_bytes == 0 || max_payload_size_bytes > u32::MAX as usize {
            return Err(CodecError::InvalidMaxPayloadSize);
        }

        Ok(Self {
            max_payload_size_bytes,
        })
    }

    pub fn from_app_config(app_config: &AppConfig) -> Result<Self, CodecError> {
        Self::new(app_config.wire.max_payload_size_bytes)
    }

    pub fn max_payload_size_bytes(&self) -> usize {
        self.max_payload_size_bytes
    }

    pub fn encode(
        &self,
        magic: Magic,
        command: CommandType,
        fields: &[&[u8]],
    ) -> Result<Vec<u8>, CodecError> {
        let expected = command.field_count();
        if fields.len() != expected {
            return Err(CodecError::FieldCountMismatch {
                command,
                expected,
                actual: fields.len(),
            });
        }

        let last = fields.len().saturating_sub(1);
        for (index, field) in fields.iter().enumerate().take(last) {
            if field.contains(&FIELD_SEPARATOR) {
                return Err(CodecError::SeparatorInField { command, index });
            }
        }

        let payload_len = fields.iter().map(|field| field.len()).sum::<usize>() + last;
        if payload_len > self.max_payload_size_bytes {
            return Err(CodecError::PayloadTooLarge {
                size: payload_len,
                limit: self.max_payload_size_bytes,
            });
        }

        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE_BYTES + payload_len);
        frame.extend_from_slice(&magic.bytes());
        frame.extend_from_slice(&command.code().to_be_bytes());
        frame.extend_from_slice(&(payload_len as u32).to_be_bytes());
        for (index, field) in fields.iter().enumerate() {
            if index > 0 {
                frame.push(FIELD_SEPARATOR);
            }
            frame.extend_from_slice(field);
        }

        Ok(frame)
    }

    /// Decodes the first frame in `buffer` without consuming anything when the
    /// frame is not fully buffered yet.
    pub fn decode(&self, buffer: &[u8], expected: Magic) -> Result<Decoded, CodecError> {
        if buffer.len() < FRAME_HEADER_SIZE_BYTES {
            return Ok(Decoded::Incomplete);
        }

        let magic_bytes = [buffer[0], buffer[1], buffer[2], buffer[3]];
        let magic = Magic::from_bytes(magic_bytes)
            .filter(|magic| *magic == expected)
            .ok_or(CodecError::InvalidMagic {
                expected,
                actual: magic_bytes,
            })?;

        let code = u32::from_be_bytes([buffer[4], buffer[5], buffer[6], buffer[7]]);
        let command = CommandType::from_code(code).ok_or(CodecError::UnknownCommand { code })?;

        let declared_len =
            u32::from_be_bytes([buffer[8], buffer[9], buffer[10], buffer[11]]) as usize;
        if declared_len > self.max_payload_size_bytes {
            return Err(CodecError::PayloadTooLarge {
                size: declared_len,
                limit: self.max_payload_size_bytes,
            });
        }

        let frame_len = FRAME_HEADER_SIZE_BYTES + declared_len;
        if buffer.len() < frame_len {
            return Ok(Decoded::Incomplete);
        }

        let fields = split_fields(command, &buffer[FRAME_HEADER_SIZE_BYTES..frame_len])?;
        Ok(Decoded::Complete {
            packet: Packet {
                magic,
                command,
                fields,
            },
            consumed: frame_len,
        })
    }
}

fn split_fields(command: CommandType, payload: &[u8]) -> Result<Vec<Vec<u8>>, CodecError> {
    let expected = command.field_count();
    if expected == 0 {
        if !payload.is_empty() {
            return Err(CodecError::FieldCountMismatch {
                command,
                expected,
                actual: 1,
            });
        }
        return Ok(Vec::new());
    }

    let fields = payload
        .splitn(expected, |byte| *byte == FIELD_SEPARATOR)
        .map(<[u8]>::to_vec)
        .collect::<Vec<_>>();
    if fields.len() != expected {
        return Err(CodecError::FieldCountMismatch {
            command,
            expected,
            actual: fields.len(),
        });
    }

    Ok(fields)
}
