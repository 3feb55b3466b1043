pub mod elf;

pub trait Header: std::fmt::Debug + Send + Sync {
    /// Returns the machine architecture identifier.
    fn machine(&self) -> u16;

    /// Returns a short human-readable name of the object type, e.g. "DYN" or "CORE".
    fn type_name(&self) -> &'static str;

    /// Returns true if the object is position independent (`ET_DYN`).
    fn is_shared_object(&self) -> bool;

    /// Returns true if the object is a core dump (`ET_CORE`).
    fn is_core(&self) -> bool;
}
