// snapshot2catalog-catalog - Catalog Updater
//
// Confirms the Run's export landed in the staging store, ensures the query
// workspace, and registers each declared table as an external Parquet table
// pointing at the new export.

pub mod client;
pub mod staging;
pub mod store;
pub mod updater;

pub use client::CatalogClient;
pub use staging::StagingStore;
pub use store::OperatorCatalog;
pub use updater::CatalogUpdater;
