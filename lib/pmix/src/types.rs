//! Core wire data model: the self-describing type tags, the tagged value
//! union, and the compound records (key/value, info, modex blobs) that move
//! between clients and the server.

use crate::status::{PmixResult, Status};

/// Upper bound on namespace identifiers, in bytes.
pub const MAX_NSLEN: usize = 255;
/// Upper bound on key strings, in bytes.
pub const MAX_KEYLEN: usize = 255;

/// Rank placeholder for job-level data that belongs to no single process.
pub const RANK_WILDCARD: i32 = -1;

/// Attribute keys recorded into the job-info blob. Stable wire constants.
pub mod attr {
    /// Range-compressed list of node names.
    pub const NODE_MAP: &str = "pmix.nmap";
    /// Range-compressed list of ranks per node.
    pub const PROC_MAP: &str = "pmix.pmap";
    /// Nested info array describing one rank; first element must be the rank.
    pub const PROC_DATA: &str = "pmix.pdata";
    /// Packed per-rank attribute blob produced from PROC_DATA.
    pub const PROC_BLOB: &str = "pmix.pblob";
    pub const RANK: &str = "pmix.rank";
    pub const HOSTNAME: &str = "pmix.hname";
    pub const LOCAL_RANK: &str = "pmix.lrank";
    pub const NODE_RANK: &str = "pmix.nrank";
    pub const APPNUM: &str = "pmix.appnum";
    pub const JOBID: &str = "pmix.jobid";
    pub const TMPDIR: &str = "pmix.tmpdir";
    pub const UNIV_SIZE: &str = "pmix.univ.size";
    pub const JOB_SIZE: &str = "pmix.job.size";
    pub const LOCAL_SIZE: &str = "pmix.local.size";
    pub const LOCAL_PEERS: &str = "pmix.lpeers";
}

/// Command opcodes carried as the leading u32 of every USER frame.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Cmd {
    Abort = 0,
    Commit = 1,
    FenceNb = 2,
    GetNb = 3,
    Finalize = 4,
    PublishNb = 5,
    LookupNb = 6,
    UnpublishNb = 7,
    SpawnNb = 8,
    ConnectNb = 9,
    DisconnectNb = 10,
}

impl Cmd {
    pub fn from_u32(raw: u32) -> Option<Cmd> {
        Some(match raw {
            0 => Cmd::Abort,
            1 => Cmd::Commit,
            2 => Cmd::FenceNb,
            3 => Cmd::GetNb,
            4 => Cmd::Finalize,
            5 => Cmd::PublishNb,
            6 => Cmd::LookupNb,
            7 => Cmd::UnpublishNb,
            8 => Cmd::SpawnNb,
            9 => Cmd::ConnectNb,
            10 => Cmd::DisconnectNb,
            _ => return None,
        })
    }
}

impl From<Cmd> for u32 {
    #[inline]
    fn from(cmd: Cmd) -> u32 {
        cmd as u32
    }
}

/// Visibility class of a committed key/value entry.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Scope {
    Undef = 0,
    Local = 1,
    Remote = 2,
    Global = 3,
}

impl Scope {
    pub fn from_u8(raw: u8) -> PmixResult<Scope> {
        Ok(match raw {
            0 => Scope::Undef,
            1 => Scope::Local,
            2 => Scope::Remote,
            3 => Scope::Global,
            _ => return Err(Status::BadParam),
        })
    }
}

/// Lifetime class of a published directory entry. Transported, not enforced
/// beyond the first-read removal rule.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Persistence {
    Indefinite = 0,
    FirstRead = 1,
    Proc = 2,
    App = 3,
    Session = 4,
}

impl Persistence {
    pub fn from_u8(raw: u8) -> PmixResult<Persistence> {
        Ok(match raw {
            0 => Persistence::Indefinite,
            1 => Persistence::FirstRead,
            2 => Persistence::Proc,
            3 => Persistence::App,
            4 => Persistence::Session,
            _ => return Err(Status::BadParam),
        })
    }
}

/// Self-describing type tags. One byte on the wire.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DataType {
    Undef = 0,
    Byte = 1,
    Bool = 2,
    String = 3,
    Size = 4,
    Pid = 5,
    Int = 6,
    Int8 = 7,
    Int16 = 8,
    Int32 = 9,
    Int64 = 10,
    Uint = 11,
    Uint8 = 12,
    Uint16 = 13,
    Uint32 = 14,
    Uint64 = 15,
    Float = 16,
    Double = 17,
    Timeval = 18,
    Time = 19,
    ByteObject = 20,
    DataType = 21,
    Value = 26,
    Buffer = 27,
    FloatArray = 31,
    DoubleArray = 32,
    StringArray = 33,
    BoolArray = 34,
    SizeArray = 35,
    ByteArray = 36,
    IntArray = 37,
    Int8Array = 38,
    Int16Array = 39,
    Int32Array = 40,
    Int64Array = 41,
    UintArray = 42,
    Uint8Array = 43,
    Uint16Array = 44,
    Uint32Array = 45,
    Uint64Array = 46,
    ByteObjectArray = 47,
    PidArray = 48,
    TimevalArray = 49,
    Kval = 50,
    Info = 51,
    Modex = 52,
    InfoArray = 53,
    Range = 54,
    App = 55,
}

impl DataType {
    pub fn from_u8(raw: u8) -> PmixResult<DataType> {
        Ok(match raw {
            0 => DataType::Undef,
            1 => DataType::Byte,
            2 => DataType::Bool,
            3 => DataType::String,
            4 => DataType::Size,
            5 => DataType::Pid,
            6 => DataType::Int,
            7 => DataType::Int8,
            8 => DataType::Int16,
            9 => DataType::Int32,
            10 => DataType::Int64,
            11 => DataType::Uint,
            12 => DataType::Uint8,
            13 => DataType::Uint16,
            14 => DataType::Uint32,
            15 => DataType::Uint64,
            16 => DataType::Float,
            17 => DataType::Double,
            18 => DataType::Timeval,
            19 => DataType::Time,
            20 => DataType::ByteObject,
            21 => DataType::DataType,
            26 => DataType::Value,
            27 => DataType::Buffer,
            31 => DataType::FloatArray,
            32 => DataType::DoubleArray,
            33 => DataType::StringArray,
            34 => DataType::BoolArray,
            35 => DataType::SizeArray,
            36 => DataType::ByteArray,
            37 => DataType::IntArray,
            38 => DataType::Int8Array,
            39 => DataType::Int16Array,
            40 => DataType::Int32Array,
            41 => DataType::Int64Array,
            42 => DataType::UintArray,
            43 => DataType::Uint8Array,
            44 => DataType::Uint16Array,
            45 => DataType::Uint32Array,
            46 => DataType::Uint64Array,
            47 => DataType::ByteObjectArray,
            48 => DataType::PidArray,
            49 => DataType::TimevalArray,
            50 => DataType::Kval,
            51 => DataType::Info,
            52 => DataType::Modex,
            53 => DataType::InfoArray,
            54 => DataType::Range,
            55 => DataType::App,
            _ => return Err(Status::UnknownDataType),
        })
    }
}

impl From<DataType> for u8 {
    #[inline]
    fn from(tag: DataType) -> u8 {
        tag as u8
    }
}

/// Seconds/microseconds pair, packed as two int64 fields.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Timeval {
    pub sec: i64,
    pub usec: i64,
}

/// Opaque sized byte payload. An empty object packs as size zero with no
/// payload bytes.
#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub struct ByteObject {
    pub bytes: Vec<u8>,
}

impl ByteObject {
    #[inline]
    pub fn new(bytes: Vec<u8>) -> ByteObject {
        ByteObject { bytes }
    }
}

/// Wire newtypes for scalars whose Rust representation is shared with
/// another tag. Each carries its own self-describing tag on the wire.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Size(pub u64);

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Pid(pub u32);

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Time(pub u64);

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Int(pub i32);

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Uint(pub u32);

/// The tagged value union. Every variant knows its own wire tag, so a value
/// can be unpacked without prior schema knowledge.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Byte(u8),
    String(String),
    Size(u64),
    Pid(u32),
    Int(i32),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Uint(u32),
    Uint8(u8),
    Uint16(u16),
    Uint32(u32),
    Uint64(u64),
    Float(f32),
    Double(f64),
    Timeval(Timeval),
    Time(u64),
    ByteObject(ByteObject),
    BoolArray(Vec<bool>),
    ByteArray(Vec<u8>),
    StringArray(Vec<String>),
    SizeArray(Vec<u64>),
    PidArray(Vec<u32>),
    IntArray(Vec<i32>),
    Int8Array(Vec<i8>),
    Int16Array(Vec<i16>),
    Int32Array(Vec<i32>),
    Int64Array(Vec<i64>),
    UintArray(Vec<u32>),
    Uint8Array(Vec<u8>),
    Uint16Array(Vec<u16>),
    Uint32Array(Vec<u32>),
    Uint64Array(Vec<u64>),
    FloatArray(Vec<f32>),
    DoubleArray(Vec<f64>),
    TimevalArray(Vec<Timeval>),
    ByteObjectArray(Vec<ByteObject>),
    InfoArray(Vec<Info>),
}

impl Value {
    /// Wire tag of the active variant.
    pub fn tag(&self) -> DataType {
        match self {
            Value::Bool(_) => DataType::Bool,
            Value::Byte(_) => DataType::Byte,
            Value::String(_) => DataType::String,
            Value::Size(_) => DataType::Size,
            Value::Pid(_) => DataType::Pid,
            Value::Int(_) => DataType::Int,
            Value::Int8(_) => DataType::Int8,
            Value::Int16(_) => DataType::Int16,
            Value::Int32(_) => DataType::Int32,
            Value::Int64(_) => DataType::Int64,
            Value::Uint(_) => DataType::Uint,
            Value::Uint8(_) => DataType::Uint8,
            Value::Uint16(_) => DataType::Uint16,
            Value::Uint32(_) => DataType::Uint32,
            Value::Uint64(_) => DataType::Uint64,
            Value::Float(_) => DataType::Float,
            Value::Double(_) => DataType::Double,
            Value::Timeval(_) => DataType::Timeval,
            Value::Time(_) => DataType::Time,
            Value::ByteObject(_) => DataType::ByteObject,
            Value::BoolArray(_) => DataType::BoolArray,
            Value::ByteArray(_) => DataType::ByteArray,
            Value::StringArray(_) => DataType::StringArray,
            Value::SizeArray(_) => DataType::SizeArray,
            Value::PidArray(_) => DataType::PidArray,
            Value::IntArray(_) => DataType::IntArray,
            Value::Int8Array(_) => DataType::Int8Array,
            Value::Int16Array(_) => DataType::Int16Array,
            Value::Int32Array(_) => DataType::Int32Array,
            Value::Int64Array(_) => DataType::Int64Array,
            Value::UintArray(_) => DataType::UintArray,
            Value::Uint8Array(_) => DataType::Uint8Array,
            Value::Uint16Array(_) => DataType::Uint16Array,
            Value::Uint32Array(_) => DataType::Uint32Array,
            Value::Uint64Array(_) => DataType::Uint64Array,
            Value::FloatArray(_) => DataType::FloatArray,
            Value::DoubleArray(_) => DataType::DoubleArray,
            Value::TimevalArray(_) => DataType::TimevalArray,
            Value::ByteObjectArray(_) => DataType::ByteObjectArray,
            Value::InfoArray(_) => DataType::InfoArray,
        }
    }
}

/// A key plus its value, the unit stored by the KV store.
#[derive(Debug, Clone, PartialEq)]
pub struct Kval {
    pub key: String,
    pub value: Value,
}

impl Kval {
    #[inline]
    pub fn new<K: Into<String>>(key: K, value: Value) -> Kval {
        Kval {
            key: key.into(),
            value,
        }
    }
}

/// A directive or attribute handed to the server, also the unit published
/// into the service directory.
#[derive(Debug, Clone, PartialEq)]
pub struct Info {
    pub key: String,
    pub value: Value,
}

impl Info {
    #[inline]
    pub fn new<K: Into<String>>(key: K, value: Value) -> Info {
        Info {
            key: key.into(),
            value,
        }
    }
}

/// One rank's packed contribution to a data-collecting collective.
#[derive(Debug, Clone, PartialEq)]
pub struct ModexData {
    pub nspace: String,
    pub rank: i32,
    pub blob: Vec<u8>,
}

/// A set of participants: a namespace plus an explicit rank list. An empty
/// rank list names every rank of the namespace.
#[derive(Debug, Clone, PartialEq)]
pub struct Range {
    pub nspace: String,
    pub ranks: Vec<i32>,
}

impl Range {
    #[inline]
    pub fn all<N: Into<String>>(nspace: N) -> Range {
        Range {
            nspace: nspace.into(),
            ranks: Vec::new(),
        }
    }

    #[inline]
    pub fn ranks<N: Into<String>>(nspace: N, ranks: Vec<i32>) -> Range {
        Range {
            nspace: nspace.into(),
            ranks,
        }
    }
}

/// One application description inside a spawn request.
#[derive(Debug, Clone, PartialEq)]
pub struct App {
    pub cmd: String,
    pub argv: Vec<String>,
    pub env: Vec<String>,
    pub maxprocs: i32,
}
