//! Per-label output catalogs.
//!
//! A catalog holds one row per detected object. Measurement fields are named
//! with the model prefix (`wmom_T`, `wmom_g`, ...); PSF, aggregated PSF and
//! detection fields are not prefixed. Serialization writes rows as maps keyed by
//! those names. Non-finite values serialize as `null`.

use serde::ser::{SerializeMap, SerializeStruct};
use serde::{Serialize, Serializer};

use crate::metacal::ShearLabel;
use crate::moments::MomentsRow;
use crate::psf::PsfStats;

/// Model prefix of the weighted-moments measurement.
pub const WMOM_MODEL: &str = "wmom";

/// Builds field names with an optional prefix.
///
/// ```
/// use metadetect::catalog::Namer;
///
/// assert_eq!(Namer::new("wmom").name("T"), "wmom_T");
/// assert_eq!(Namer::new("").name("T"), "T");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namer {
    front: String,
}

impl Namer {
    pub fn new(front: impl Into<String>) -> Self {
        Self {
            front: front.into(),
        }
    }

    pub fn name(&self, field: &str) -> String {
        if self.front.is_empty() {
            field.to_string()
        } else {
            format!("{}_{}", self.front, field)
        }
    }
}

const MODEL_FIELDS: [&str; 8] = ["flags", "s2n", "pars", "g", "g_cov", "T", "T_err", "T_ratio"];

/// One object in one label's catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogRow {
    /// Union of model and PSF measurement flags
    pub flags: u32,
    pub measurement: MomentsRow,
    pub psfrec_flags: u32,
    pub psfrec_g: [f64; 2],
    pub psfrec_t: f64,
    pub sx_row: f64,
    pub sx_col: f64,
}

impl CatalogRow {
    /// Combine a measurement with the shared PSF statistics and the detection position.
    pub fn new(measurement: MomentsRow, psf_stats: &PsfStats, sx_row: f64, sx_col: f64) -> Self {
        Self {
            flags: measurement.combined_flags(),
            measurement,
            psfrec_flags: psf_stats.flags(),
            psfrec_g: psf_stats.g(),
            psfrec_t: psf_stats.t(),
            sx_row,
            sx_col,
        }
    }
}

/// All rows measured on one sheared realization.
#[derive(Debug, Clone, PartialEq)]
pub struct Catalog {
    namer: Namer,
    label: ShearLabel,
    rows: Vec<CatalogRow>,
}

impl Catalog {
    pub fn new(model: &str, label: ShearLabel, rows: Vec<CatalogRow>) -> Self {
        Self {
            namer: Namer::new(model),
            label,
            rows,
        }
    }

    pub fn label(&self) -> ShearLabel {
        self.label
    }

    pub fn namer(&self) -> &Namer {
        &self.namer
    }

    pub fn rows(&self) -> &[CatalogRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows with `flags == 0`.
    pub fn successful(&self) -> impl Iterator<Item = &CatalogRow> {
        self.rows.iter().filter(|row| row.flags == 0)
    }

    /// Field names in serialization order.
    pub fn column_names(&self) -> Vec<String> {
        let mut names = vec![
            "flags".to_string(),
            "psf_flags".to_string(),
            "psf_g".to_string(),
            "psf_T".to_string(),
        ];
        names.extend(MODEL_FIELDS.iter().map(|f| self.namer.name(f)));
        names.extend(
            ["psfrec_flags", "psfrec_g", "psfrec_T", "sx_row", "sx_col"]
                .iter()
                .map(|s| s.to_string()),
        );
        names
    }
}

struct NamedRow<'a> {
    names: &'a [String],
    row: &'a CatalogRow,
}

impl Serialize for NamedRow<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let row = self.row;
        let m = &row.measurement;
        let mut map = serializer.serialize_map(Some(self.names.len()))?;
        let mut names = self.names.iter();
        let mut next = || names.next().map(String::as_str).unwrap_or_default();

        map.serialize_entry(next(), &row.flags)?;
        map.serialize_entry(next(), &m.psf_flags)?;
        map.serialize_entry(next(), &m.psf_g)?;
        map.serialize_entry(next(), &m.psf_t)?;
        map.serialize_entry(next(), &m.flags)?;
        map.serialize_entry(next(), &m.s2n)?;
        map.serialize_entry(next(), &m.pars)?;
        map.serialize_entry(next(), &m.g)?;
        map.serialize_entry(next(), &m.g_cov)?;
        map.serialize_entry(next(), &m.t)?;
        map.serialize_entry(next(), &m.t_err)?;
        map.serialize_entry(next(), &m.t_ratio)?;
        map.serialize_entry(next(), &row.psfrec_flags)?;
        map.serialize_entry(next(), &row.psfrec_g)?;
        map.serialize_entry(next(), &row.psfrec_t)?;
        map.serialize_entry(next(), &row.sx_row)?;
        map.serialize_entry(next(), &row.sx_col)?;
        map.end()
    }
}

struct NamedRows<'a> {
    names: &'a [String],
    rows: &'a [CatalogRow],
}

impl Serialize for NamedRows<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.rows.iter().map(|row| NamedRow {
            names: self.names,
            row,
        }))
    }
}

impl Serialize for Catalog {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let names = self.column_names();
        let mut state = serializer.serialize_struct("Catalog", 3)?;
        state.serialize_field("label", &self.label)?;
        state.serialize_field("model", &self.namer.front)?;
        state.serialize_field(
            "rows",
            &NamedRows {
                names: &names,
                rows: &self.rows,
            },
        )?;
        state.end()
    }
}
