//! Utility macros for error handling.

/// Creates a [`crate::error::ChetlError`] from an error kind and description.
///
/// The two-argument form takes a static description; the three-argument form
/// adds a dynamic detail.
#[macro_export]
macro_rules! chetl_error {
    ($kind:expr, $desc:expr) => {
        $crate::error::ChetlError::from(($kind, $desc))
    };
    ($kind:expr, $desc:expr, $detail:expr) => {
        $crate::error::ChetlError::from(($kind, $desc, $detail.to_string()))
    };
}

/// Creates and returns a [`crate::error::ChetlError`] from the current
/// function.
#[macro_export]
macro_rules! bail {
    ($kind:expr, $desc:expr) => {
        return Err($crate::chetl_error!($kind, $desc))
    };
    ($kind:expr, $desc:expr, $detail:expr) => {
        return Err($crate::chetl_error!($kind, $desc, $detail))
    };
}
