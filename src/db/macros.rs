//! Database dispatch macros for reducing code duplication.
//!
//! The per-backend enums ([`DbPool`](crate::db::pool::DbPool) and the pooled
//! connection inside [`DbConnection`](crate::db::connection::DbConnection))
//! carry one variant per driver. The macro below writes the match for them
//! while keeping each arm's concrete type visible.

/// Macro for generating backend dispatch match arms.
///
/// The enum must be in scope at the call site.
///
/// # Example
///
/// ```ignore
/// impl_db_dispatch!(DbPool, pool, {
///     MySql(p) => p.close().await,
///     Postgres(p) => p.close().await,
///     SQLite(p) => p.close().await,
/// });
/// ```
#[macro_export]
macro_rules! impl_db_dispatch {
    ($enum:ident, $value:expr, { $($variant:ident($p:ident) => $body:expr),+ $(,)? }) => {
        match $value {
            $(
                $enum::$variant($p) => $body,
            )+
        }
    };
}

pub use impl_db_dispatch;

#[cfg(test)]
mod tests {
    #[derive(Debug)]
    enum Backend {
        MySql(u8),
        Postgres(u16),
        SQLite(u32),
    }

    fn widen(backend: &Backend) -> u64 {
        impl_db_dispatch!(Backend, backend, {
            MySql(v) => u64::from(*v),
            Postgres(v) => u64::from(*v) * 10,
            SQLite(v) => u64::from(*v) * 100,
        })
    }

    #[test]
    fn test_dispatch_keeps_arm_types() {
        assert_eq!(widen(&Backend::MySql(1)), 1);
        assert_eq!(widen(&Backend::Postgres(2)), 20);
        assert_eq!(widen(&Backend::SQLite(3)), 300);
    }
}
