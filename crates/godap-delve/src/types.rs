//! Records exchanged with Delve's `RPCServer` (API version 2).
//!
//! Field names follow Delve's JSON tags. Go's JSON decoder matches keys
//! case-insensitively, so request structs always use Delve's canonical
//! spelling while response structs accept the lower-camel aliases emitted by
//! older servers.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type GoroutineId = i64;

/// Id Delve assigns to its internal "unrecovered panic" breakpoint.
pub const UNRECOVERED_PANIC_ID: i64 = -1;
/// Id Delve assigns to its internal "fatal throw" breakpoint.
pub const FATAL_THROW_ID: i64 = -2;

#[derive(Debug, Error)]
pub enum DelveError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("timed out waiting for delve reply")]
    Timeout,

    #[error("delve connection closed")]
    ConnectionClosed,

    #[error("delve request cancelled")]
    Cancelled,

    /// Error string returned by the backend for a single call.
    #[error("{0}")]
    Rpc(String),

    #[error("delve protocol error: {0}")]
    Protocol(String),
}

impl DelveError {
    /// The backend's own error text, if this error came from a failed call.
    pub fn rpc_message(&self) -> Option<&str> {
        match self {
            Self::Rpc(message) => Some(message),
            _ => None,
        }
    }

    /// `true` when the connection itself is gone (as opposed to a single failed call).
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::ConnectionClosed | Self::Cancelled | Self::Protocol(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, DelveError>;

/// Go's `reflect.Kind`, as reported in [`Variable::kind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReflectKind {
    Invalid,
    Bool,
    Int,
    Int8,
    Int16,
    Int32,
    Int64,
    Uint,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Uintptr,
    Float32,
    Float64,
    Complex64,
    Complex128,
    Array,
    Chan,
    Func,
    Interface,
    Map,
    Ptr,
    Slice,
    String,
    Struct,
    UnsafePointer,
}

impl ReflectKind {
    const ALL: [ReflectKind; 27] = [
        Self::Invalid,
        Self::Bool,
        Self::Int,
        Self::Int8,
        Self::Int16,
        Self::Int32,
        Self::Int64,
        Self::Uint,
        Self::Uint8,
        Self::Uint16,
        Self::Uint32,
        Self::Uint64,
        Self::Uintptr,
        Self::Float32,
        Self::Float64,
        Self::Complex64,
        Self::Complex128,
        Self::Array,
        Self::Chan,
        Self::Func,
        Self::Interface,
        Self::Map,
        Self::Ptr,
        Self::Slice,
        Self::String,
        Self::Struct,
        Self::UnsafePointer,
    ];

    pub fn from_raw(raw: u8) -> Self {
        Self::ALL
            .get(usize::from(raw))
            .copied()
            .unwrap_or(Self::Invalid)
    }

    pub fn as_raw(self) -> u8 {
        self as u8
    }
}

/// Bit flags carried in [`Variable::flags`].
pub mod variable_flags {
    pub const ESCAPED: u16 = 1;
    pub const SHADOWED: u16 = 2;
    pub const CONSTANT: u16 = 4;
    pub const ARGUMENT: u16 = 8;
    pub const RETURN_ARGUMENT: u16 = 16;
    pub const FAKE_ADDRESS: u16 = 32;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Function {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub value: u64,
    #[serde(default, rename = "type")]
    pub type_: u8,
    #[serde(default, rename = "goType")]
    pub go_type: u64,
    #[serde(default)]
    pub optimized: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Location {
    #[serde(default)]
    pub pc: u64,
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub line: i64,
    #[serde(default)]
    pub function: Option<Function>,
}

impl Location {
    pub fn function_name(&self) -> Option<&str> {
        self.function
            .as_ref()
            .map(|f| f.name.as_str())
            .filter(|name| !name.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Stackframe {
    #[serde(flatten)]
    pub location: Location,
    #[serde(default, rename = "Locals", skip_serializing_if = "Option::is_none")]
    pub locals: Option<Vec<Variable>>,
    #[serde(default, rename = "Arguments", skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Vec<Variable>>,
    #[serde(default, rename = "FrameOffset")]
    pub frame_offset: i64,
    #[serde(default, rename = "Err", skip_serializing_if = "String::is_empty")]
    pub err: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Breakpoint {
    #[serde(default)]
    pub id: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default)]
    pub addr: u64,
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub line: i64,
    #[serde(default, rename = "functionName", skip_serializing_if = "String::is_empty")]
    pub function_name: String,
    #[serde(default, rename = "Cond", alias = "cond", skip_serializing_if = "String::is_empty")]
    pub cond: String,
    #[serde(default, rename = "continue")]
    pub tracepoint: bool,
    #[serde(default)]
    pub goroutine: bool,
    #[serde(default)]
    pub stacktrace: i64,
    #[serde(default, rename = "LoadArgs", alias = "loadArgs", skip_serializing_if = "Option::is_none")]
    pub load_args: Option<LoadConfig>,
    #[serde(default, rename = "LoadLocals", alias = "loadLocals", skip_serializing_if = "Option::is_none")]
    pub load_locals: Option<LoadConfig>,
    #[serde(default, rename = "totalHitCount")]
    pub total_hit_count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Thread {
    pub id: i64,
    #[serde(default)]
    pub pc: u64,
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub line: i64,
    #[serde(default)]
    pub function: Option<Function>,
    #[serde(default, rename = "goroutineID")]
    pub goroutine_id: GoroutineId,
    #[serde(default, rename = "breakPoint")]
    pub breakpoint: Option<Breakpoint>,
    #[serde(default, rename = "ReturnValues")]
    pub return_values: Option<Vec<Variable>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Goroutine {
    pub id: GoroutineId,
    #[serde(default, rename = "currentLoc")]
    pub current_loc: Location,
    #[serde(default, rename = "userCurrentLoc")]
    pub user_current_loc: Location,
    #[serde(default, rename = "goStatementLoc")]
    pub go_statement_loc: Location,
    #[serde(default, rename = "threadID")]
    pub thread_id: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DebuggerState {
    #[serde(default, rename = "Running")]
    pub running: bool,
    #[serde(default, rename = "currentThread")]
    pub current_thread: Option<Thread>,
    #[serde(default, rename = "currentGoroutine")]
    pub current_goroutine: Option<Goroutine>,
    #[serde(default, rename = "Threads")]
    pub threads: Option<Vec<Thread>>,
    #[serde(default, rename = "NextInProgress")]
    pub next_in_progress: bool,
    #[serde(default)]
    pub exited: bool,
    #[serde(default, rename = "exitStatus")]
    pub exit_status: i64,
}

impl DebuggerState {
    /// Id of the breakpoint the current thread is stopped on, if any.
    pub fn breakpoint_id(&self) -> Option<i64> {
        self.current_thread
            .as_ref()
            .and_then(|thread| thread.breakpoint.as_ref())
            .map(|bp| bp.id)
    }
}

/// A runtime value as reported by Delve.
///
/// This is the raw wire shape; kind-dependent fields are only meaningful for
/// some kinds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub addr: u64,
    #[serde(default, rename = "onlyAddr")]
    pub only_addr: bool,
    #[serde(default, rename = "type")]
    pub type_: String,
    #[serde(default, rename = "realType")]
    pub real_type: String,
    #[serde(default)]
    pub flags: u16,
    #[serde(default)]
    pub kind: u8,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub len: i64,
    #[serde(default)]
    pub cap: i64,
    #[serde(default)]
    pub children: Vec<Variable>,
    #[serde(default)]
    pub base: u64,
    #[serde(default)]
    pub unreadable: String,
    #[serde(default, rename = "DeclLine")]
    pub decl_line: i64,
}

impl Variable {
    pub fn reflect_kind(&self) -> ReflectKind {
        ReflectKind::from_raw(self.kind)
    }

    pub fn has_flag(&self, flag: u16) -> bool {
        self.flags & flag != 0
    }
}

/// Controls how much of a value Delve loads eagerly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadConfig {
    #[serde(rename = "FollowPointers", alias = "followPointers")]
    pub follow_pointers: bool,
    #[serde(rename = "MaxVariableRecurse", alias = "maxVariableRecurse")]
    pub max_variable_recurse: i64,
    #[serde(rename = "MaxStringLen", alias = "maxStringLen")]
    pub max_string_len: i64,
    #[serde(rename = "MaxArrayValues", alias = "maxArrayValues")]
    pub max_array_values: i64,
    #[serde(rename = "MaxStructFields", alias = "maxStructFields")]
    pub max_struct_fields: i64,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            follow_pointers: true,
            max_variable_recurse: 1,
            max_string_len: 64,
            max_array_values: 64,
            max_struct_fields: -1,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvalScope {
    #[serde(rename = "GoroutineID")]
    pub goroutine_id: GoroutineId,
    #[serde(default, rename = "Frame")]
    pub frame: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PackageBuildInfo {
    #[serde(rename = "ImportPath")]
    pub import_path: String,
    #[serde(rename = "DirectoryPath")]
    pub directory_path: String,
    #[serde(default, rename = "Files")]
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VersionInfo {
    #[serde(rename = "DelveVersion")]
    pub delve_version: String,
    #[serde(rename = "APIVersion")]
    pub api_version: i64,
}

// Call arguments and results. Each `RPCServer.<Method>` takes a single
// positional argument and returns a single object.

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateIn {
    #[serde(rename = "NonBlocking")]
    pub non_blocking: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateOut {
    #[serde(rename = "State")]
    pub state: DebuggerState,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DebuggerCommand {
    pub name: String,
    #[serde(default, rename = "goroutineID", skip_serializing_if = "Option::is_none")]
    pub goroutine_id: Option<GoroutineId>,
    #[serde(default, rename = "ReturnInfoLoadConfig", skip_serializing_if = "Option::is_none")]
    pub return_info_load_config: Option<LoadConfig>,
    #[serde(default, rename = "expr", skip_serializing_if = "String::is_empty")]
    pub expr: String,
    #[serde(default, rename = "unsafeCall")]
    pub unsafe_call: bool,
}

impl DebuggerCommand {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandOut {
    #[serde(rename = "State")]
    pub state: DebuggerState,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateBreakpointIn {
    #[serde(rename = "Breakpoint")]
    pub breakpoint: Breakpoint,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateBreakpointOut {
    #[serde(rename = "Breakpoint")]
    pub breakpoint: Breakpoint,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClearBreakpointIn {
    #[serde(rename = "Id")]
    pub id: i64,
    #[serde(default, rename = "Name", skip_serializing_if = "String::is_empty")]
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClearBreakpointOut {
    #[serde(default, rename = "Breakpoint")]
    pub breakpoint: Option<Breakpoint>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListBreakpointsIn {
    #[serde(default, rename = "All")]
    pub all: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListBreakpointsOut {
    #[serde(default, rename = "Breakpoints")]
    pub breakpoints: Vec<Breakpoint>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListGoroutinesIn {
    #[serde(default, rename = "Start")]
    pub start: i64,
    #[serde(default, rename = "Count")]
    pub count: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListGoroutinesOut {
    #[serde(default, rename = "Goroutines")]
    pub goroutines: Vec<Goroutine>,
    #[serde(default, rename = "Nextg")]
    pub nextg: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StacktraceIn {
    #[serde(rename = "Id")]
    pub id: GoroutineId,
    #[serde(rename = "Depth")]
    pub depth: i64,
    #[serde(default, rename = "Full")]
    pub full: bool,
    #[serde(default, rename = "Cfg", skip_serializing_if = "Option::is_none")]
    pub cfg: Option<LoadConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StacktraceOut {
    #[serde(default, rename = "Locations")]
    pub locations: Vec<Stackframe>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListLocalVarsIn {
    #[serde(rename = "Scope")]
    pub scope: EvalScope,
    #[serde(rename = "Cfg")]
    pub cfg: LoadConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListLocalVarsOut {
    #[serde(default, rename = "Variables")]
    pub variables: Vec<Variable>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListFunctionArgsIn {
    #[serde(rename = "Scope")]
    pub scope: EvalScope,
    #[serde(rename = "Cfg")]
    pub cfg: LoadConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListFunctionArgsOut {
    #[serde(default, rename = "Args")]
    pub args: Vec<Variable>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListPackageVarsIn {
    #[serde(rename = "Filter")]
    pub filter: String,
    #[serde(rename = "Cfg")]
    pub cfg: LoadConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListPackageVarsOut {
    #[serde(default, rename = "Variables")]
    pub variables: Vec<Variable>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvalIn {
    #[serde(rename = "Scope")]
    pub scope: EvalScope,
    #[serde(rename = "Expr")]
    pub expr: String,
    #[serde(default, rename = "Cfg", skip_serializing_if = "Option::is_none")]
    pub cfg: Option<LoadConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvalOut {
    #[serde(rename = "Variable")]
    pub variable: Variable,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SetIn {
    #[serde(rename = "Scope")]
    pub scope: EvalScope,
    #[serde(rename = "Symbol")]
    pub symbol: String,
    #[serde(rename = "Value")]
    pub value: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetachIn {
    #[serde(rename = "Kill")]
    pub kill: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListPackagesBuildInfoIn {
    #[serde(rename = "IncludeFiles")]
    pub include_files: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListPackagesBuildInfoOut {
    #[serde(default, rename = "List")]
    pub list: Vec<PackageBuildInfo>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListSourcesIn {
    #[serde(default, rename = "Filter", skip_serializing_if = "String::is_empty")]
    pub filter: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListSourcesOut {
    #[serde(default, rename = "Sources")]
    pub sources: Vec<String>,
}

/// Empty argument/result object (`GetVersionIn`, `SetOut`, `DetachOut`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Empty {}
