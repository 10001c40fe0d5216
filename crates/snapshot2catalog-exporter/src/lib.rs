// snapshot2catalog-exporter - Snapshot Exporter
//
// Finds the newest automated snapshot of the source cluster, starts one vendor
// export per Run into the Run's staging prefix, and polls it to a terminal
// state with bounded exponential backoff.

pub mod exporter;
pub mod vendor;

pub use exporter::{resolve_endpoints, ExportSettings, SnapshotExporter};
pub use vendor::{ExportVendor, StartExportRequest, VendorError};
