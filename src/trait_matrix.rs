//! Continuous character matrix with soft-delete exclusion masks.
//!
//! Excluding a taxon or character never removes data; it only marks the
//! index, so every index keeps its meaning until `remove_excluded_characters`
//! is called explicitly.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::error::{Result, TraitError};

/// Observed values for one taxon. `NaN` marks an unresolved observation.
#[derive(Clone, Debug, PartialEq)]
pub struct TaxonData {
    name: String,
    values: Vec<f64>,
}

impl TaxonData {
    pub fn new(name: impl Into<String>, values: Vec<f64>) -> Self {
        TaxonData {
            name: name.into(),
            values,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn number_of_characters(&self) -> usize {
        self.values.len()
    }

    pub fn character(&self, index: usize) -> Result<f64> {
        self.values
            .get(index)
            .copied()
            .ok_or_else(|| TraitError::out_of_range("character", index, self.values.len()))
    }

    pub fn is_character_resolved(&self, index: usize) -> Result<bool> {
        Ok(!self.character(index)?.is_nan())
    }

    pub fn add_character(&mut self, value: f64) {
        self.values.push(value);
    }

    /// Physically delete the given character positions.
    pub fn remove_characters(&mut self, indices: &BTreeSet<usize>) {
        let mut i = 0;
        self.values.retain(|_| {
            let keep = !indices.contains(&i);
            i += 1;
            keep
        });
    }

    /// Append another taxon's characters; the names must agree.
    pub fn concatenate(&mut self, other: &TaxonData) -> Result<()> {
        if other.name != self.name {
            return Err(TraitError::taxa_mismatch(format!(
                "cannot append '{}' to '{}'",
                other.name, self.name
            )));
        }
        self.values.extend_from_slice(&other.values);
        Ok(())
    }
}

#[derive(Clone, Debug, Default)]
pub struct TraitMatrix {
    taxa: Vec<TaxonData>,
    species: Vec<String>,
    name_to_index: HashMap<String, usize>,
    excluded_taxa: BTreeSet<usize>,
    excluded_characters: BTreeSet<usize>,
}

impl TraitMatrix {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a matrix from `(name, values)` rows.
    pub fn from_rows<S: Into<String>>(rows: impl IntoIterator<Item = (S, Vec<f64>)>) -> Result<Self> {
        let mut matrix = TraitMatrix::new();
        for (name, values) in rows {
            matrix.add_taxon_data(TaxonData::new(name, values))?;
        }
        Ok(matrix)
    }

    /// Append a taxon. Its species defaults to its own name.
    pub fn add_taxon_data(&mut self, data: TaxonData) -> Result<()> {
        if self.name_to_index.contains_key(data.name()) {
            return Err(TraitError::invalid_input(format!("duplicate taxon '{}'", data.name())));
        }
        if let Some(first) = self.taxa.first() {
            if first.number_of_characters() != data.number_of_characters() {
                return Err(TraitError::invalid_input(format!(
                    "taxon '{}' has {} characters, matrix has {}",
                    data.name(),
                    data.number_of_characters(),
                    first.number_of_characters()
                )));
            }
        }
        self.name_to_index.insert(data.name().to_string(), self.taxa.len());
        self.species.push(data.name().to_string());
        self.taxa.push(data);
        Ok(())
    }

    pub fn number_of_taxa(&self) -> usize {
        self.taxa.len()
    }

    pub fn number_of_included_taxa(&self) -> usize {
        self.taxa.len() - self.excluded_taxa.len()
    }

    pub fn number_of_characters(&self) -> usize {
        self.taxa.first().map_or(0, TaxonData::number_of_characters)
    }

    pub fn number_of_included_characters(&self) -> usize {
        self.number_of_characters() - self.excluded_characters.len()
    }

    pub fn taxon_data(&self, index: usize) -> Result<&TaxonData> {
        self.taxa
            .get(index)
            .ok_or_else(|| TraitError::out_of_range("taxon", index, self.taxa.len()))
    }

    pub fn taxon_data_by_name(&self, name: &str) -> Result<&TaxonData> {
        self.taxon_index(name)
            .map(|i| &self.taxa[i])
            .ok_or_else(|| TraitError::taxon_not_found(name))
    }

    /// Position of a taxon, `None` if absent.
    pub fn taxon_index(&self, name: &str) -> Option<usize> {
        self.name_to_index.get(name).copied()
    }

    pub fn taxon_names(&self) -> Vec<&str> {
        self.taxa.iter().map(TaxonData::name).collect()
    }

    /// Value of one character of one taxon.
    pub fn character(&self, taxon: usize, character: usize) -> Result<f64> {
        self.taxon_data(taxon)?.character(character)
    }

    pub fn is_character_resolved(&self, taxon: usize, character: usize) -> Result<bool> {
        self.taxon_data(taxon)?.is_character_resolved(character)
    }

    pub fn exclude_character(&mut self, index: usize) -> Result<()> {
        self.check_character(index)?;
        self.excluded_characters.insert(index);
        Ok(())
    }

    pub fn include_character(&mut self, index: usize) -> Result<()> {
        self.check_character(index)?;
        self.excluded_characters.remove(&index);
        Ok(())
    }

    pub fn exclude_all_characters(&mut self) {
        self.excluded_characters.extend(0..self.number_of_characters());
    }

    pub fn is_character_excluded(&self, index: usize) -> bool {
        self.excluded_characters.contains(&index)
    }

    pub fn exclude_taxon(&mut self, index: usize) -> Result<()> {
        self.check_taxon(index)?;
        self.excluded_taxa.insert(index);
        Ok(())
    }

    pub fn restore_taxon(&mut self, index: usize) -> Result<()> {
        self.check_taxon(index)?;
        self.excluded_taxa.remove(&index);
        Ok(())
    }

    pub fn is_taxon_excluded(&self, index: usize) -> bool {
        self.excluded_taxa.contains(&index)
    }

    /// Physically delete every excluded character and clear the mask.
    pub fn remove_excluded_characters(&mut self) {
        for taxon in &mut self.taxa {
            taxon.remove_characters(&self.excluded_characters);
        }
        self.excluded_characters.clear();
    }

    /// Included character indices in order. Excluded indices are skipped.
    pub fn included_character_indices(&self) -> Result<Vec<usize>> {
        let n = self.number_of_characters();
        for (i, taxon) in self.taxa.iter().enumerate() {
            if !self.is_taxon_excluded(i) && taxon.number_of_characters() != n {
                return Err(TraitError::invalid_input(format!(
                    "taxon '{}' has {} characters, expected {}",
                    taxon.name(),
                    taxon.number_of_characters(),
                    n
                )));
            }
        }
        Ok((0..n).filter(|i| !self.is_character_excluded(*i)).collect())
    }

    /// Append the characters of `other`, matching taxa by name.
    ///
    /// Excluded characters of `other` stay excluded at their shifted positions.
    pub fn concatenate(&mut self, other: &TraitMatrix) -> Result<()> {
        let mine: HashSet<&str> = self.taxa.iter().map(TaxonData::name).collect();
        let theirs: HashSet<&str> = other.taxa.iter().map(TaxonData::name).collect();
        if mine != theirs {
            let mut missing: Vec<&str> = mine.symmetric_difference(&theirs).copied().collect();
            missing.sort_unstable();
            return Err(TraitError::taxa_mismatch(format!(
                "taxa present in only one matrix: {}",
                missing.join(", ")
            )));
        }

        let offset = self.number_of_characters();
        for taxon in &mut self.taxa {
            let theirs = other.taxon_data_by_name(taxon.name())?;
            taxon.concatenate(theirs)?;
        }
        self.excluded_characters
            .extend(other.excluded_characters.iter().map(|i| i + offset));
        Ok(())
    }

    pub fn set_taxon_name(&mut self, old: &str, new: impl Into<String>) -> Result<()> {
        let new = new.into();
        let index = self
            .taxon_index(old)
            .ok_or_else(|| TraitError::taxon_not_found(old))?;
        if old != new && self.name_to_index.contains_key(&new) {
            return Err(TraitError::invalid_input(format!("duplicate taxon '{}'", new)));
        }
        self.name_to_index.remove(old);
        self.name_to_index.insert(new.clone(), index);
        if self.species[index] == old {
            self.species[index] = new.clone();
        }
        self.taxa[index].name = new;
        Ok(())
    }

    /// Assign a taxon (an individual) to a species.
    pub fn set_species(&mut self, taxon: &str, species: impl Into<String>) -> Result<()> {
        let index = self
            .taxon_index(taxon)
            .ok_or_else(|| TraitError::taxon_not_found(taxon))?;
        self.species[index] = species.into();
        Ok(())
    }

    pub fn species_of(&self, taxon: usize) -> Result<&str> {
        self.species
            .get(taxon)
            .map(String::as_str)
            .ok_or_else(|| TraitError::out_of_range("taxon", taxon, self.taxa.len()))
    }

    /// Species labels of included taxa, in first-appearance order.
    pub fn species_names(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.included_taxa()
            .map(|i| self.species[i].as_str())
            .filter(|s| seen.insert(*s))
            .collect()
    }

    /// Included taxon indices belonging to `species`.
    pub fn taxa_of_species(&self, species: &str) -> Vec<usize> {
        self.included_taxa().filter(|&i| self.species[i] == species).collect()
    }

    pub fn species_mean(&self, species: &str, character: usize) -> Result<f64> {
        let members = self.species_members(species)?;
        let mut sum = 0.0;
        for &i in &members {
            sum += self.character(i, character)?;
        }
        Ok(sum / members.len() as f64)
    }

    /// Sample variance among a species' individuals (n - 1 denominator).
    pub fn within_species_variance(&self, species: &str, character: usize) -> Result<f64> {
        let members = self.species_members(species)?;
        if members.len() < 2 {
            return Ok(0.0);
        }
        let mean = self.species_mean(species, character)?;
        let mut ss = 0.0;
        for &i in &members {
            let d = self.character(i, character)? - mean;
            ss += d * d;
        }
        Ok(ss / (members.len() - 1) as f64)
    }

    /// Mean over included taxa of one character.
    pub fn mean_value(&self, character: usize) -> Result<f64> {
        let values = self.included_values(character)?;
        if values.is_empty() {
            return Err(TraitError::invalid_input("no included taxa"));
        }
        Ok(values.iter().sum::<f64>() / values.len() as f64)
    }

    /// Sample variance over included taxa of one character.
    pub fn var_value(&self, character: usize) -> Result<f64> {
        let values = self.included_values(character)?;
        if values.len() < 2 {
            return Err(TraitError::invalid_input("variance needs at least two included taxa"));
        }
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        let ss: f64 = values.iter().map(|v| (v - mean) * (v - mean)).sum();
        Ok(ss / (values.len() - 1) as f64)
    }

    pub fn max_difference(&self, character: usize) -> Result<f64> {
        Ok(self.pairwise_differences(character)?.into_iter().fold(0.0, f64::max))
    }

    pub fn min_difference(&self, character: usize) -> Result<f64> {
        Ok(self
            .pairwise_differences(character)?
            .into_iter()
            .fold(f64::INFINITY, f64::min))
    }

    pub fn mean_difference(&self, character: usize) -> Result<f64> {
        let diffs = self.pairwise_differences(character)?;
        if diffs.is_empty() {
            return Err(TraitError::invalid_input("differences need at least two included taxa"));
        }
        Ok(diffs.iter().sum::<f64>() / diffs.len() as f64)
    }

    fn pairwise_differences(&self, character: usize) -> Result<Vec<f64>> {
        let values = self.included_values(character)?;
        let mut diffs = Vec::with_capacity(values.len() * values.len().saturating_sub(1) / 2);
        for i in 0..values.len() {
            for j in (i + 1)..values.len() {
                diffs.push((values[i] - values[j]).abs());
            }
        }
        Ok(diffs)
    }

    fn included_values(&self, character: usize) -> Result<Vec<f64>> {
        self.check_character(character)?;
        self.included_taxa()
            .map(|i| self.character(i, character))
            .collect()
    }

    fn included_taxa(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.taxa.len()).filter(move |i| !self.excluded_taxa.contains(i))
    }

    fn species_members(&self, species: &str) -> Result<Vec<usize>> {
        let members = self.taxa_of_species(species);
        if members.is_empty() {
            return Err(TraitError::taxon_not_found(species));
        }
        Ok(members)
    }

    fn check_character(&self, index: usize) -> Result<()> {
        let n = self.number_of_characters();
        if index >= n {
            return Err(TraitError::out_of_range("character", index, n));
        }
        Ok(())
    }

    fn check_taxon(&self, index: usize) -> Result<()> {
        if index >= self.taxa.len() {
            return Err(TraitError::out_of_range("taxon", index, self.taxa.len()));
        }
        Ok(())
    }
}
