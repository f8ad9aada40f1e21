// Line-oriented wire format for the comet TCP subscribe protocol.
//
// Requests are an argument array: `*<argc>\r\n` followed by `argc` bulk
// arguments `$<len>\r\n<bytes>\r\n`. Pushes reuse the bulk encoding.
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const MIN_ARGS: usize = 1;
pub const MAX_ARGS: usize = 4;
pub const DEFAULT_MAX_ARG_BYTES: usize = 1024;
// `*`/`$` prefix lines never need more than a handful of digits.
const MAX_LINE_BYTES: usize = 24;
const CRLF: &[u8] = b"\r\n";

/// Single byte a client sends to keep its connection alive.
pub const HEARTBEAT: u8 = b'h';
pub const HEARTBEAT_REPLY: &[u8] = b"+h\r\n";
pub const PARAM_REPLY: &[u8] = b"-p\r\n";
pub const AUTH_REPLY: &[u8] = b"-a\r\n";
pub const CHANNEL_REPLY: &[u8] = b"-c\r\n";
pub const NODE_REPLY: &[u8] = b"-n\r\n";

pub const CMD_SUBSCRIBE: &str = "sub";

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("unexpected prefix byte {0:#04x}")]
    InvalidPrefix(u8),
    #[error("missing CRLF terminator")]
    MissingCrlf,
    #[error("invalid length line")]
    InvalidLength,
    #[error("argument count {0} outside [{MIN_ARGS}, {MAX_ARGS}]")]
    ArgCount(usize),
    #[error("argument of {len} bytes exceeds limit {max}")]
    ArgTooLarge { len: usize, max: usize },
    #[error("unknown command {0:?}")]
    UnknownCommand(String),
    #[error("invalid {0} argument")]
    InvalidArgument(&'static str),
}

/// Decoded request argument array; the first argument is the command name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub args: Vec<Bytes>,
}

impl Request {
    pub fn new<I, B>(args: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn command(&self) -> &[u8] {
        self.args.first().map(|arg| arg.as_ref()).unwrap_or_default()
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'*');
        buf.extend_from_slice(self.args.len().to_string().as_bytes());
        buf.extend_from_slice(CRLF);
        for arg in &self.args {
            put_bulk(&mut buf, arg);
        }
        buf.freeze()
    }
}

/// Incremental request decoder over a connection read buffer.
///
/// ```
/// use bytes::BytesMut;
/// use comet_wire::{Request, RequestDecoder};
///
/// let encoded = Request::new(["sub", "alice", "30"]).encode();
/// let mut buf = BytesMut::from(&encoded[..]);
/// let request = RequestDecoder::default().decode(&mut buf).expect("valid").expect("complete");
/// assert_eq!(request.command(), b"sub");
/// assert!(buf.is_empty());
/// ```
#[derive(Debug, Clone, Copy)]
pub struct RequestDecoder {
    max_arg_bytes: usize,
}

impl Default for RequestDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ARG_BYTES)
    }
}

impl RequestDecoder {
    pub fn new(max_arg_bytes: usize) -> Self {
        Self { max_arg_bytes }
    }

    /// Returns `Ok(None)` until a whole request is buffered; consumes nothing then.
    pub fn decode(&self, buf: &mut BytesMut) -> Result<Option<Request>> {
        let mut cursor = &buf[..];
        let Some(argc) = read_prefixed_len(&mut cursor, b'*')? else {
            return Ok(None);
        };
        if !(MIN_ARGS..=MAX_ARGS).contains(&argc) {
            return Err(Error::ArgCount(argc));
        }

        let mut args = Vec::with_capacity(argc);
        for _ in 0..argc {
            let Some(len) = read_prefixed_len(&mut cursor, b'$')? else {
                return Ok(None);
            };
            if len > self.max_arg_bytes {
                return Err(Error::ArgTooLarge {
                    len,
                    max: self.max_arg_bytes,
                });
            }
            if cursor.len() < len + CRLF.len() {
                return Ok(None);
            }
            if &cursor[len..len + CRLF.len()] != CRLF {
                return Err(Error::MissingCrlf);
            }
            args.push(len);
            cursor = &cursor[len + CRLF.len()..];
        }

        // Second pass over the validated frame: split arguments out without copying.
        let consumed = buf.len() - cursor.len();
        let mut frame = buf.split_to(consumed).freeze();
        skip_line(&mut frame);
        let args = args
            .into_iter()
            .map(|len| {
                skip_line(&mut frame);
                let arg = frame.split_to(len);
                frame.advance(CRLF.len());
                arg
            })
            .collect();
        Ok(Some(Request { args }))
    }
}

/// Commands understood by the TCP front end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Subscribe(SubscribeArgs),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeArgs {
    pub key: String,
    pub heartbeat_secs: u64,
    pub token: Option<String>,
}

impl Command {
    pub fn parse(request: &Request) -> Result<Self> {
        match request.command() {
            b"sub" => SubscribeArgs::parse(&request.args[1..]).map(Command::Subscribe),
            other => Err(Error::UnknownCommand(
                String::from_utf8_lossy(other).into_owned(),
            )),
        }
    }
}

impl SubscribeArgs {
    // `sub <key> <heartbeat-secs> [token]`
    fn parse(args: &[Bytes]) -> Result<Self> {
        if args.len() < 2 {
            return Err(Error::ArgCount(args.len() + 1));
        }
        let key = utf8(&args[0], "key")?;
        if key.is_empty() {
            return Err(Error::InvalidArgument("key"));
        }
        let heartbeat_secs = utf8(&args[1], "heartbeat")?
            .parse::<u64>()
            .map_err(|_| Error::InvalidArgument("heartbeat"))?;
        let token = args
            .get(2)
            .map(|arg| utf8(arg, "token"))
            .transpose()?
            .filter(|token| !token.is_empty());
        Ok(Self {
            key,
            heartbeat_secs,
            token,
        })
    }
}

/// Frame a push payload as a bulk string.
pub fn encode_push(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(payload.len() + MAX_LINE_BYTES);
    put_bulk(&mut buf, payload);
    buf.freeze()
}

/// Decode one bulk push frame, for clients and tests.
pub fn decode_push(buf: &mut BytesMut) -> Result<Option<Bytes>> {
    let mut cursor = &buf[..];
    let Some(len) = read_prefixed_len(&mut cursor, b'$')? else {
        return Ok(None);
    };
    if cursor.len() < len + CRLF.len() {
        return Ok(None);
    }
    if &cursor[len..len + CRLF.len()] != CRLF {
        return Err(Error::MissingCrlf);
    }
    let header = buf.len() - cursor.len();
    buf.advance(header);
    let payload = buf.split_to(len).freeze();
    buf.advance(CRLF.len());
    Ok(Some(payload))
}

fn put_bulk(buf: &mut BytesMut, payload: &[u8]) {
    buf.put_u8(b'$');
    buf.extend_from_slice(payload.len().to_string().as_bytes());
    buf.extend_from_slice(CRLF);
    buf.extend_from_slice(payload);
    buf.extend_from_slice(CRLF);
}

// Parse `<prefix><digits>\r\n`, advancing `cursor` past it on success.
fn read_prefixed_len(cursor: &mut &[u8], prefix: u8) -> Result<Option<usize>> {
    let Some(&first) = cursor.first() else {
        return Ok(None);
    };
    if first != prefix {
        return Err(Error::InvalidPrefix(first));
    }
    let Some(end) = cursor.windows(CRLF.len()).position(|window| window == CRLF) else {
        if cursor.len() > MAX_LINE_BYTES {
            return Err(Error::MissingCrlf);
        }
        return Ok(None);
    };
    let digits = std::str::from_utf8(&cursor[1..end]).map_err(|_| Error::InvalidLength)?;
    let len = digits.parse::<usize>().map_err(|_| Error::InvalidLength)?;
    *cursor = &cursor[end + CRLF.len()..];
    Ok(Some(len))
}

fn skip_line(frame: &mut Bytes) {
    if let Some(end) = frame.windows(CRLF.len()).position(|window| window == CRLF) {
        frame.advance(end + CRLF.len());
    }
}

fn utf8(arg: &Bytes, name: &'static str) -> Result<String> {
    std::str::from_utf8(arg)
        .map(str::to_owned)
        .map_err(|_| Error::InvalidArgument(name))
}
