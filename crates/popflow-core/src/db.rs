use sqlx::any::install_default_drivers;
use sqlx::{AnyConnection, Connection};

use crate::error::LoadError;

/// Opens a single fresh connection to the destination database. The URL scheme
/// picks the driver (`postgres://` in production, `sqlite://` in tests).
pub async fn connect(database_url: &str) -> Result<AnyConnection, LoadError> {
    install_default_drivers();
    AnyConnection::connect(database_url)
        .await
        .map_err(LoadError::Connect)
}
