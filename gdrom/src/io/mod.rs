//! Sector sources for disc image containers (flat ISO/BIN, GDI track sets).

use std::path::Path;

use tracing::debug;

use crate::{
    read::{Partition, SectorSource},
    Result,
};

pub(crate) mod gdi;
pub(crate) mod iso;

/// Opens a disc image, choosing the source by file extension.
pub fn open(path: &Path) -> Result<(Box<dyn SectorSource>, Partition)> {
    let is_gdi = path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("gdi"));
    if is_gdi {
        let source = gdi::GdiSource::open(path)?;
        let partition = source.high_density_partition()?;
        debug!("Opened GDI {} ({:?})", path.display(), partition);
        Ok((Box::new(source), partition))
    } else {
        let source = iso::IsoSource::open(path)?;
        let partition = source.partition();
        debug!(
            "Opened image {} ({} byte sectors, {:?})",
            path.display(),
            source.sector_size(),
            partition
        );
        Ok((Box::new(source), partition))
    }
}
