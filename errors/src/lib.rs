use thiserror::Error;

#[derive(Error, PartialEq, Eq, Debug, Clone)]
pub enum TxScriptError {
    #[error("invalid push length encoding: {0:02x?}")]
    MalformedPushSize(Vec<u8>),
    #[error("opcode requires {0} bytes, but script only has {1} remaining")]
    MalformedPush(usize, usize),
    #[error("transaction input index {0} is out of range (tx has {1} inputs)")]
    InvalidIndex(usize, usize),
    #[error("introspected input index {0} is out of range (tx has {1} inputs)")]
    InvalidInputIndex(i64, usize),
    #[error("introspected output index {0} is out of range (tx has {1} outputs)")]
    InvalidOutputIndex(i64, usize),
    #[error("combined stack size {0} > max allowed {1}")]
    StackSizeExceeded(usize, usize),
    #[error("element size {0} exceeds max allowed size {1}")]
    ElementTooBig(usize, usize),
    #[error("script of size {0} exceeded maximum allowed size of {1}")]
    ScriptSize(usize, usize),
    #[error("attempt to execute invalid opcode {0}")]
    InvalidOpcode(String),
    #[error("attempt to execute reserved opcode {0}")]
    OpcodeReserved(String),
    #[error("attempt to execute disabled opcode {0}")]
    OpcodeDisabled(String),
    #[error("attempt to read from empty stack")]
    EmptyStack,
    #[error("stack contains {0} unexpected items")]
    CleanStack(usize),
    #[error("false stack entry at end of script execution")]
    EvalFalse,
    #[error("script returned early")]
    EarlyReturn,
    #[error("encountered invalid state while running script: {0}")]
    InvalidState(String),
    #[error("opcode requires at least {0} but stack has only {1}")]
    InvalidStackOperation(usize, usize),
    #[error("end of script reached in conditional execution")]
    UnbalancedConditional,
    #[error("script index {0} beyond total scripts {1}")]
    InvalidProgramCounter(usize, usize),
    #[error("no scripts to run")]
    NoScripts,
    #[error("signature script is not push only")]
    SignatureScriptNotPushOnly,
    #[error("push encoding is not minimal: {0}")]
    NotMinimalData(String),
    #[error("conditional argument must be an empty vector or [0x01]")]
    MinimalIf,
    #[error("number too big: {0}")]
    NumberTooBig(String),
    #[error("attempt to divide by zero")]
    DivideByZero,
    #[error("expected an 8-byte little-endian operand, got {0} bytes")]
    ExpectedLe64(usize),
    #[error("invalid hash type {0:#04x}")]
    InvalidSigHashType(u8),
    #[error("invalid taproot signature length {0}")]
    InvalidTaprootSigLen(usize),
    #[error("taproot public key is empty")]
    TaprootPubkeyIsEmpty,
    #[error("public key of length {0} is an unknown key type")]
    DiscourageUpgradeablePubKeyType(usize),
    #[error("tapscript is attempting to use leaf version {0:#04x}")]
    DiscourageUpgradeableTaprootVersion(u8),
    #[error("witness program empty passed empty witness")]
    WitnessProgramEmpty,
    #[error("native witness program cannot also have a signature script")]
    WitnessMalleated,
    #[error("non-witness inputs cannot have a witness")]
    WitnessUnexpected,
    #[error("witness has no annex")]
    WitnessHasNoAnnex,
    #[error("tapscript signature operations budget exhausted")]
    TaprootMaxSigOps,
    #[error("control block of size {0} is not valid")]
    ControlBlockSize(usize),
    #[error("leaf commitment is not proven by the control block")]
    TaprootCommitmentMismatch,
    #[error("signature invalid: {0}")]
    InvalidSignature(secp256k1::Error),
    #[error("unsupported public key type")]
    PubKeyFormat,
    #[error("unsatisfied lock time: {0}")]
    UnsatisfiedLockTime(String),
    #[error("asset packet not set")]
    AssetPacketMissing,
    #[error("asset index {0} is out of range (have {1} entries)")]
    AssetIndexOutOfRange(i64, usize),
    #[error("asset amount aggregation overflowed")]
    AssetOverflow,
    #[error("invalid asset introspection source {0}")]
    InvalidAssetSource(i64),
    #[error("malformed streaming sha256 context: {0}")]
    InvalidSha256Context(String),
}
