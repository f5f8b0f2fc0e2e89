use crate::config::ClassifySettings;
use crate::raster::Raster;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassifyOptions {
    /// Largest accepted coordinate uncertainty, in metres.
    pub limit: f64,
    /// Subtracted from the raw cell value to obtain the zone code.
    pub offset: i32,
    /// Raw cell value meaning "no data".
    pub nodata: i32,
}

impl Default for ClassifyOptions {
    fn default() -> Self {
        Self {
            limit: 4500.0,
            offset: 10,
            nodata: 0,
        }
    }
}

impl From<&ClassifySettings> for ClassifyOptions {
    fn from(settings: &ClassifySettings) -> Self {
        Self {
            limit: settings.coord_uncertainty_limit,
            offset: settings.zone_offset,
            nodata: settings.nodata,
        }
    }
}

/// Zone code for one occurrence, or `None` when the record is skipped.
///
/// Missing precision counts as 0. Unparsable fields, precision above the
/// limit, points outside the raster and no-data cells all skip the record.
pub fn classify<R: Raster + ?Sized>(
    precision: &str,
    x: &str,
    y: &str,
    raster: &R,
    options: &ClassifyOptions,
) -> Option<i32> {
    let precision = precision.trim();
    let precision: f64 = if precision.is_empty() {
        0.0
    } else {
        precision.parse().ok()?
    };
    let x: f64 = x.trim().parse().ok()?;
    let y: f64 = y.trim().parse().ok()?;
    if precision.is_nan() || precision > options.limit {
        return None;
    }
    let raw = raster.sample(x, y)?;
    if raw == options.nodata {
        return None;
    }
    Some(raw - options.offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::GridRaster;

    fn raster() -> GridRaster {
        // 2x2 grid over [0, 20) x [0, 20)
        GridRaster::new(0.0, 20.0, 10.0, 2, 2, vec![12, 0, 13, 17]).unwrap()
    }

    #[test]
    fn classifies_point_inside_raster() {
        let options = ClassifyOptions::default();
        assert_eq!(classify("100", "5", "15", &raster(), &options), Some(2));
        assert_eq!(classify("", "15", "5", &raster(), &options), Some(7));
    }

    #[test]
    fn skips_unparsable_fields() {
        let options = ClassifyOptions::default();
        assert_eq!(classify("abc", "10", "20", &raster(), &options), None);
        assert_eq!(classify("1", "east", "5", &raster(), &options), None);
        assert_eq!(classify("1", "5", "", &raster(), &options), None);
    }

    #[test]
    fn skips_imprecise_records() {
        let options = ClassifyOptions::default();
        assert_eq!(classify("4500", "5", "15", &raster(), &options), Some(2));
        assert_eq!(classify("4500.5", "5", "15", &raster(), &options), None);
        assert_eq!(classify("NaN", "5", "15", &raster(), &options), None);
    }

    #[test]
    fn skips_no_data_and_out_of_bounds() {
        let options = ClassifyOptions::default();
        assert_eq!(classify("0", "15", "15", &raster(), &options), None);
        assert_eq!(classify("0", "25", "15", &raster(), &options), None);
        assert_eq!(classify("0", "5", "-5", &raster(), &options), None);
    }
}
