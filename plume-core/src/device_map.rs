/// Where the resource environment places its tensors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceMap {
    ForceCpu,
    /// Accelerator ordinal; falls back to CPU when no accelerator is compiled in.
    Ordinal(usize),
}

impl DeviceMap {
    pub fn from_cpu_flag(cpu: bool) -> Self {
        if cpu {
            Self::ForceCpu
        } else {
            Self::default()
        }
    }
}

impl Default for DeviceMap {
    fn default() -> Self {
        Self::Ordinal(0)
    }
}
