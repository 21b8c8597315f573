use vepline_core::{Lane, ValidationError};

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("lane {0} is not served by this bus")]
    UnknownLane(Lane),

    #[error("lane {0} already has a subscriber")]
    AlreadySubscribed(Lane),

    #[error("lane {0} is closed")]
    Closed(Lane),
}

/// Failures surfaced synchronously to a submitter.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("bus error: {0}")]
    Bus(#[from] BusError),
}
