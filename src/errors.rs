use thiserror::Error;

use crate::hw::QueueId;
use crate::pool::PoolId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("physical address {0:#x} outside mapped regions")]
    NotMapped(u64),
    #[error("buffer pool {0:?} exhausted")]
    PoolExhausted(PoolId),
    #[error("pool {0:?} still busy after bounded release retries")]
    ReleaseTimeout(PoolId),
    #[error("pool {0:?} is not registered")]
    UnknownPool(PoolId),
    #[error("unsupported frame format {0:#x}")]
    BadFormat(u8),
    #[error("scatter-gather table has no final entry within bounds")]
    SgOverflow,
    #[error("too many segments: {0}")]
    TooManySegments(u16),
    #[error("carrier buffer too small for {segs} table entries")]
    CarrierTooSmall { segs: u16 },
    #[error("too big packet: {0}")]
    TooBigPacket(usize),
    #[error("volatile dequeue already active on {0:?}")]
    QueueBusy(QueueId),
    #[error("failure in affining portal")]
    PortalAffinity,
}

pub type Result<T> = std::result::Result<T, Error>;
