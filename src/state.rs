use crate::db::{DbPool, OrmConn};

/// Application state handed to every handler. Built once in `main` (or a
/// test harness) from the factories in `db`, never read from module-level
/// globals, so a failed connection surfaces at startup.
#[derive(Clone)]
pub struct AppState {
    pub pool: DbPool,
    pub orm: OrmConn,
}
