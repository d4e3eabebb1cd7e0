use thiserror::Error;

#[derive(Error, Debug)]
pub enum RingError {
    #[error("flash device not present or not recognized")]
    DeviceNotValid,

    #[error("partition start {0:#010x} is not sector aligned")]
    UnalignedStart(u32),

    #[error("partition end {0:#010x} is not sector aligned")]
    UnalignedEnd(u32),

    #[error("partition [{start:#010x}, {end:#010x}) contains no sectors")]
    EmptyPartition { start: u32, end: u32 },

    #[error("buffer is not loaded; call load or format first")]
    NotLoaded,

    #[error("invalid sector magic {magic:#010x} in sector {sector}")]
    InvalidMagic { sector: u16, magic: u32 },

    #[error("invalid record size {size} in sector {sector} at offset {offset}")]
    InvalidRecordSize {
        sector: u16,
        offset: usize,
        size: u16,
    },

    #[error("record overruns sector {sector} at offset {offset}")]
    RecordOverrun { sector: u16, offset: usize },

    #[error("record {index} does not exist in sector {sector}")]
    RecordNotFound { sector: u16, index: usize },

    #[error("record of {size} bytes exceeds the maximum of {max}")]
    RecordTooLarge { size: usize, max: usize },

    #[error("payload buffer is not allocated")]
    UnallocatedBuffer,

    #[error("sector sequence chain broken at sector {sector}")]
    BrokenChain { sector: u16 },

    #[error("no sector carries sequence {sequence}")]
    SequenceNotFound { sequence: u32 },

    #[error("no write sector found (every sector is finalized)")]
    MissingWriteSector,

    #[error("sector {sector} failed validation")]
    ValidationFailed { sector: u16 },

    #[error("sector {sector} cannot admit the record after reclamation")]
    NoSpaceAfterReclaim { sector: u16 },
}

pub type Result<T> = std::result::Result<T, RingError>;
