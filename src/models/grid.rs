use ndarray::{Array2, Zip};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{ProcessingError, Result};
use crate::utils::coordinates::nearest_index;

/// A named 2-D (lat x lon) model field with its own axes
#[derive(Debug, Clone, PartialEq)]
pub struct GriddedField {
    pub name: String,
    pub lats: Arc<Vec<f64>>,
    pub lons: Arc<Vec<f64>>,
    pub values: Array2<f64>,
}

impl GriddedField {
    pub fn new(
        name: impl Into<String>,
        lats: Arc<Vec<f64>>,
        lons: Arc<Vec<f64>>,
        values: Array2<f64>,
    ) -> Result<Self> {
        let name = name.into();
        if values.dim() != (lats.len(), lons.len()) {
            return Err(ProcessingError::InvalidFormat(format!(
                "Field '{}' has shape {:?} but axes are {}x{}",
                name,
                values.dim(),
                lats.len(),
                lons.len()
            )));
        }
        Ok(Self {
            name,
            lats,
            lons,
            values,
        })
    }

    /// Independent nearest latitude and longitude indices of a point
    pub fn cell_index(&self, lat: f64, lon: f64) -> Option<(usize, usize)> {
        Some((nearest_index(&self.lats, lat)?, nearest_index(&self.lons, lon)?))
    }

    /// Value of the nearest cell, `None` when the cell holds NaN
    pub fn nearest_value(&self, lat: f64, lon: f64) -> Option<f64> {
        let (i, j) = self.cell_index(lat, lon)?;
        let value = self.values[[i, j]];
        if value.is_nan() {
            None
        } else {
            Some(value)
        }
    }

    pub fn shares_grid_with(&self, other: &GriddedField) -> bool {
        self.lats == other.lats && self.lons == other.lons
    }

    /// Cell-wise combination with another field on the same grid
    pub fn zip_with<F>(&self, other: &GriddedField, name: &str, f: F) -> Result<GriddedField>
    where
        F: Fn(f64, f64) -> f64,
    {
        if !self.shares_grid_with(other) {
            return Err(ProcessingError::InvalidFormat(format!(
                "Fields '{}' and '{}' are not on the same grid",
                self.name, other.name
            )));
        }
        let values = Zip::from(&self.values)
            .and(&other.values)
            .map_collect(|&a, &b| f(a, b));
        GriddedField::new(name, self.lats.clone(), self.lons.clone(), values)
    }
}

/// All fields read for one timestamp
#[derive(Debug, Clone, Default)]
pub struct GriddedFields {
    pub fields: BTreeMap<String, GriddedField>,
    pub lats: Arc<Vec<f64>>,
    pub lons: Arc<Vec<f64>>,
}

impl GriddedFields {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a field; the first field inserted provides the default axes
    pub fn insert(&mut self, field: GriddedField) {
        if self.fields.is_empty() {
            self.lats = field.lats.clone();
            self.lons = field.lons.clone();
        }
        self.fields.insert(field.name.clone(), field);
    }

    pub fn get(&self, name: &str) -> Option<&GriddedField> {
        self.fields.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }
}
