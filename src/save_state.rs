use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::apu::ApuState;
use crate::cpu::CpuState;
use crate::mapper::MapperState;
use crate::ppu::PpuState;

pub const SAVE_STATE_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum SaveStateError {
    #[error("save state belongs to a different ROM")]
    MismatchedRom,
    #[error("save state version {0} is not supported")]
    UnsupportedVersion(u32),
    #[error("save state data is corrupt")]
    Corrupt,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveState {
    pub version: u32,
    pub rom_md5: [u8; 16],
    pub cpu: CpuState,
    pub ppu: PpuState,
    pub apu: ApuState,
    pub mapper: MapperState,
}

impl SaveState {
    pub fn to_bytes(&self) -> Result<Vec<u8>, SaveStateError> {
        bincode::serialize(self).map_err(|_| SaveStateError::Corrupt)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SaveStateError> {
        bincode::deserialize(bytes).map_err(|_| SaveStateError::Corrupt)
    }
}
