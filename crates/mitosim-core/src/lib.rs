//! Core engine for the mitosim workspace.
//!
//! Simulates the evolution of a clonally reproducing cell population under
//! birth, death, and mutation, advancing in discrete tau-leap intervals and
//! recording statistical and phylogenetic traces for downstream consumers.

use rand::{Rng, SeedableRng, rngs::SmallRng};
use rand_distr::Exp1;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::mem;
use std::sync::Once;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Identifier of the synthetic phylogeny root. Founder cells carry it as
/// their parent id, meaning "no parent".
pub const ROOT_CELL_ID: u32 = 0;

/// Placeholder origin written into a mutation record while the daughter cell
/// that acquired it has not been assigned an id yet. Daughter ids always
/// exceed every founder id, so the placeholder cannot collide with a real
/// origin.
const ORIGIN_PENDING: u32 = 0;

/// Multiplier for deriving independent per-cell decision streams from a
/// per-step seed.
const DECISION_STREAM_PRIME: u64 = 0x9E37_79B9_7F4A_7C15;

/// Broad effect classes a mutation can belong to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MutationVariant {
    Driver,
    Positive,
    Neutral,
    Negative,
}

/// One entry of the mutation catalog.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct MutationType {
    pub type_id: u8,
    pub variant: MutationVariant,
    /// Fractional fitness multiplier delta applied to the mutant daughter.
    pub effect: f64,
    /// Per-division probability of this specific class arising.
    pub probability: f64,
}

/// Immutable menu of mutation classes known to a simulation.
///
/// Configuration order is preserved: the per-division uniform draw walks the
/// entries cumulatively, so the order is part of the sampling semantics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MutationCatalog {
    entries: Vec<MutationType>,
    total_probability: f64,
}

impl MutationCatalog {
    #[must_use]
    pub fn new(entries: Vec<MutationType>) -> Self {
        let total_probability = entries.iter().map(|entry| entry.probability).sum();
        Self {
            entries,
            total_probability,
        }
    }

    /// Number of catalog entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true when no mutation classes are configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cumulative per-division probability of any mutation arising.
    #[must_use]
    pub fn total_probability(&self) -> f64 {
        self.total_probability
    }

    /// Iterate over the entries in configuration order.
    pub fn iter(&self) -> impl Iterator<Item = &MutationType> {
        self.entries.iter()
    }

    /// Look up a catalog entry by its type id.
    #[must_use]
    pub fn get(&self, type_id: u8) -> Option<&MutationType> {
        self.entries.iter().find(|entry| entry.type_id == type_id)
    }

    /// Effect class of a type id, if the id is known.
    #[must_use]
    pub fn variant_of(&self, type_id: u8) -> Option<MutationVariant> {
        self.get(type_id).map(|entry| entry.variant)
    }

    /// Select the mutation class hit by a uniform draw in `[0, 1)`, walking
    /// the catalog cumulatively. `None` means the division stays clean.
    #[must_use]
    pub fn select(&self, draw: f64) -> Option<&MutationType> {
        if draw >= self.total_probability {
            return None;
        }
        let mut accumulated = 0.0;
        for entry in &self.entries {
            accumulated += entry.probability;
            if draw < accumulated {
                return Some(entry);
            }
        }
        None
    }
}

/// One acquired mutation: the cell it arose in and the catalog class.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct MutationRecord {
    pub origin_cell: u32,
    pub type_id: u8,
}

/// A living cell record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Cell {
    pub id: u32,
    /// Id of the mother, or [`ROOT_CELL_ID`] for founders.
    pub parent_id: u32,
    pub fitness: f64,
    /// Zero while the cell is alive.
    pub death_time: f64,
    /// Ordered mutation history, oldest first.
    pub mutations: Vec<MutationRecord>,
}

impl Cell {
    /// A founder cell seeded at initialisation.
    #[must_use]
    pub fn founder(id: u32) -> Self {
        Self {
            id,
            parent_id: ROOT_CELL_ID,
            fitness: 1.0,
            death_time: 0.0,
            mutations: Vec::new(),
        }
    }

    /// A daughter produced by division, before id assignment. Inherits the
    /// mother's mutation history verbatim.
    #[must_use]
    pub fn daughter(mother: &Cell, fitness: f64) -> Self {
        Self {
            id: ORIGIN_PENDING,
            parent_id: mother.id,
            fitness,
            death_time: 0.0,
            mutations: mother.mutations.clone(),
        }
    }
}

/// Dense store of the living population.
///
/// Cells live in a dense vector with an id-to-index slot map on the side;
/// insert and remove are O(1) (swap-remove with slot fixup) and iteration in
/// dense order is the deterministic enumeration order the stepper relies on.
/// Cloning the store is the deep population copy used by snapshots.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CellStore {
    slots: HashMap<u32, usize>,
    cells: Vec<Cell>,
}

impl CellStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: HashMap::with_capacity(capacity),
            cells: Vec::with_capacity(capacity),
        }
    }

    /// Number of living cells.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Returns true when the population is extinct.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Returns true if `id` refers to a living cell.
    #[must_use]
    pub fn contains(&self, id: u32) -> bool {
        self.slots.contains_key(&id)
    }

    /// Borrow a cell by id.
    #[must_use]
    pub fn get(&self, id: u32) -> Option<&Cell> {
        self.slots.get(&id).map(|&index| &self.cells[index])
    }

    /// Dense slice of the living population.
    #[must_use]
    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    /// Iterate over the living cells in dense order.
    pub fn iter(&self) -> impl Iterator<Item = &Cell> {
        self.cells.iter()
    }

    /// Insert a cell keyed by its own id. Returns false (and leaves the
    /// store untouched) if the id is already present.
    pub fn insert(&mut self, cell: Cell) -> bool {
        if self.slots.contains_key(&cell.id) {
            return false;
        }
        self.slots.insert(cell.id, self.cells.len());
        self.cells.push(cell);
        true
    }

    /// Remove `id`, returning the cell if it was present.
    pub fn remove(&mut self, id: u32) -> Option<Cell> {
        let index = self.slots.remove(&id)?;
        let removed = self.cells.swap_remove(index);
        debug_assert_eq!(removed.id, id);
        if index < self.cells.len() {
            let moved = self.cells[index].id;
            if let Some(slot) = self.slots.get_mut(&moved) {
                *slot = index;
            }
        }
        Some(removed)
    }

    /// Largest id in the store, if any.
    #[must_use]
    pub fn max_id(&self) -> Option<u32> {
        self.slots.keys().copied().max()
    }
}

/// What the graveyard retains about a dead cell. The full mutation history
/// dies with the cell.
#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct GraveRecord {
    pub parent_id: u32,
    pub death_time: f64,
}

/// Store of every cell that has died, keyed by id.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Graveyard {
    records: HashMap<u32, GraveRecord>,
}

impl Graveyard {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub fn contains(&self, id: u32) -> bool {
        self.records.contains_key(&id)
    }

    #[must_use]
    pub fn get(&self, id: u32) -> Option<&GraveRecord> {
        self.records.get(&id)
    }

    pub fn insert(&mut self, id: u32, record: GraveRecord) {
        self.records.insert(id, record);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&u32, &GraveRecord)> {
        self.records.iter()
    }
}

/// Scalar statistics of the living population at one instant.
///
/// Skewness and kurtosis are raw central moments; consumers divide by
/// `variance^1.5` / `variance^2` if they want the standardised forms.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct StatSnapshot {
    pub tau: f64,
    pub mean_fitness: f64,
    pub fitness_variance: f64,
    pub mean_mutations: f64,
    pub mutations_variance: f64,
    pub total_living_cells: usize,
    pub fitness_skewness: f64,
    pub fitness_kurtosis: f64,
    pub mutations_skewness: f64,
    pub mutations_kurtosis: f64,
}

impl StatSnapshot {
    /// Measure the population in a single pass over the store.
    ///
    /// An extinct population records a zeroed row so the extinction stays
    /// visible in the report.
    #[must_use]
    pub fn measure(tau: f64, cells: &CellStore) -> Self {
        let count = cells.len();
        if count == 0 {
            return Self {
                tau,
                ..Self::default()
            };
        }

        let mut sum_f = 0.0;
        let mut sum_f2 = 0.0;
        let mut sum_f3 = 0.0;
        let mut sum_f4 = 0.0;
        let mut sum_m = 0.0;
        let mut sum_m2 = 0.0;
        let mut sum_m3 = 0.0;
        let mut sum_m4 = 0.0;

        for cell in cells.iter() {
            let f = cell.fitness;
            let f2 = f * f;
            sum_f += f;
            sum_f2 += f2;
            sum_f3 += f2 * f;
            sum_f4 += f2 * f2;

            let m = cell.mutations.len() as f64;
            let m2 = m * m;
            sum_m += m;
            sum_m2 += m2;
            sum_m3 += m2 * m;
            sum_m4 += m2 * m2;
        }

        let inv = 1.0 / count as f64;
        let mean_f = sum_f * inv;
        let raw2_f = sum_f2 * inv;
        let raw3_f = sum_f3 * inv;
        let raw4_f = sum_f4 * inv;
        let mean_m = sum_m * inv;
        let raw2_m = sum_m2 * inv;
        let raw3_m = sum_m3 * inv;
        let raw4_m = sum_m4 * inv;

        Self {
            tau,
            mean_fitness: mean_f,
            fitness_variance: raw2_f - mean_f * mean_f,
            mean_mutations: mean_m,
            mutations_variance: raw2_m - mean_m * mean_m,
            total_living_cells: count,
            fitness_skewness: raw3_f - 3.0 * mean_f * raw2_f + 2.0 * mean_f.powi(3),
            fitness_kurtosis: raw4_f - 4.0 * mean_f * raw3_f + 6.0 * mean_f * mean_f * raw2_f
                - 3.0 * mean_f.powi(4),
            mutations_skewness: raw3_m - 3.0 * mean_m * raw2_m + 2.0 * mean_m.powi(3),
            mutations_kurtosis: raw4_m - 4.0 * mean_m * raw3_m + 6.0 * mean_m * mean_m * raw2_m
                - 3.0 * mean_m.powi(4),
        }
    }
}

/// Deep copy of the living population at a generation boundary.
#[derive(Debug, Clone, Serialize)]
pub struct PopulationSnapshot {
    /// Generation index, `floor(tau)` at capture time.
    pub generation: i64,
    pub cells: CellStore,
}

/// Which stepper advances the population.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SimulationType {
    StochasticTauLeap,
    /// Reserved in the configuration schema; no integrator is implemented.
    DeterministicRk4,
}

/// Errors raised while validating a simulation configuration.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
    #[error("simulation type {0:?} is not implemented")]
    UnsupportedSimType(SimulationType),
}

/// Static configuration for one simulation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub sim_type: SimulationType,
    /// Simulated-time increment per step.
    pub tau_step: f64,
    /// Founder population size, seeded with ids `0..initial_population`.
    pub initial_population: usize,
    /// Carrying capacity coupling the per-cell death rate to density.
    pub env_capacity: usize,
    /// Step budget for the orchestrated run.
    pub steps: u32,
    /// StatSnapshot cadence in integer generations.
    pub statistics_resolution: u32,
    /// PopulationSnapshot cadence in integer generations.
    pub population_statistics_res: u32,
    /// Directory for report emission; empty disables it.
    #[serde(default)]
    pub output_path: String,
    /// Seed for reproducible runs; absent draws one from entropy.
    #[serde(default)]
    pub rng_seed: Option<u64>,
    /// Mutation catalog in selection order.
    #[serde(default)]
    pub mutations: Vec<MutationType>,
}

impl SimulationConfig {
    /// Fail-fast validation of every constraint the engine assumes.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.tau_step.is_finite() && self.tau_step > 0.0) {
            return Err(ConfigError::Invalid("tau_step must be positive and finite"));
        }
        if self.env_capacity == 0 {
            return Err(ConfigError::Invalid("env_capacity must be at least 1"));
        }
        if self.initial_population == 0 && self.steps > 0 {
            return Err(ConfigError::Invalid(
                "initial_population must be non-zero for a stepped run",
            ));
        }
        if self.statistics_resolution == 0 {
            return Err(ConfigError::Invalid(
                "statistics_resolution must be at least 1",
            ));
        }
        if self.population_statistics_res == 0 {
            return Err(ConfigError::Invalid(
                "population_statistics_res must be at least 1",
            ));
        }

        let mut seen_ids = HashSet::with_capacity(self.mutations.len());
        let mut total_probability = 0.0;
        for mutation in &self.mutations {
            if !seen_ids.insert(mutation.type_id) {
                return Err(ConfigError::Invalid("duplicate mutation type_id"));
            }
            if !(mutation.probability.is_finite() && (0.0..=1.0).contains(&mutation.probability)) {
                return Err(ConfigError::Invalid(
                    "mutation probability must lie in [0, 1]",
                ));
            }
            if !(mutation.effect.is_finite() && mutation.effect > -1.0) {
                return Err(ConfigError::Invalid(
                    "mutation effect must be finite and greater than -1 so fitness stays positive",
                ));
            }
            total_probability += mutation.probability;
        }
        if total_probability > 1.0 {
            return Err(ConfigError::Invalid(
                "mutation probabilities must sum to at most 1",
            ));
        }
        Ok(())
    }

    /// Returns the configured RNG, seeding from entropy if no seed is set.
    fn seeded_rng(&self) -> SmallRng {
        match self.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::seed_from_u64(rand::random()),
        }
    }
}

/// Outcome decided for one living cell inside the parallel region.
enum CellFate {
    Unchanged,
    Death,
    Division { daughters: [Cell; 2] },
}

/// Independent decision stream for the cell at `index`, derived from a
/// per-step seed so the result does not depend on how rayon splits the range.
fn decision_rng(step_seed: u64, index: usize) -> SmallRng {
    SmallRng::seed_from_u64(step_seed.wrapping_add((index as u64).wrapping_mul(DECISION_STREAM_PRIME)))
}

/// Produce the two daughters of a dividing mother. At most one daughter per
/// division acquires a mutation, and it is always the first of the pair.
fn divide(mother: &Cell, draw: f64, catalog: &MutationCatalog) -> [Cell; 2] {
    match catalog.select(draw) {
        Some(class) => {
            let mut mutant = Cell::daughter(mother, mother.fitness * (1.0 + class.effect));
            mutant.mutations.push(MutationRecord {
                origin_cell: ORIGIN_PENDING,
                type_id: class.type_id,
            });
            [mutant, Cell::daughter(mother, mother.fitness)]
        }
        None => [
            Cell::daughter(mother, mother.fitness),
            Cell::daughter(mother, mother.fitness),
        ],
    }
}

/// The tau-leap evolution engine.
///
/// One [`step`](Simulation::step) advances simulated time by `tau_step`:
/// propensity draws, a parallel per-cell fate decision, and a sequential
/// commit that moves the dead to the graveyard, assigns densely packed ids
/// to newborns, and updates the counters. Snapshots are taken strictly
/// between steps.
pub struct Simulation {
    config: SimulationConfig,
    catalog: MutationCatalog,
    cells: CellStore,
    graveyard: Graveyard,
    stat_report: Vec<StatSnapshot>,
    popul_report: Vec<PopulationSnapshot>,
    tau: f64,
    actual_population: usize,
    total_deaths: usize,
    last_stat_generation: i64,
    last_popul_generation: i64,
    rng: SmallRng,
}

impl std::fmt::Debug for Simulation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Simulation")
            .field("tau", &self.tau)
            .field("actual_population", &self.actual_population)
            .field("total_deaths", &self.total_deaths)
            .field("catalog_len", &self.catalog.len())
            .finish()
    }
}

impl Simulation {
    /// Build an engine from a validated configuration, seeding the founder
    /// population with ids `0..initial_population`.
    pub fn new(config: SimulationConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        if config.sim_type != SimulationType::StochasticTauLeap {
            return Err(ConfigError::UnsupportedSimType(config.sim_type));
        }

        let catalog = MutationCatalog::new(config.mutations.clone());
        let mut cells = CellStore::with_capacity(config.initial_population);
        for id in 0..config.initial_population as u32 {
            cells.insert(Cell::founder(id));
        }
        let rng = config.seeded_rng();
        info!(
            initial_population = config.initial_population,
            env_capacity = config.env_capacity,
            tau_step = config.tau_step,
            total_mutation_probability = catalog.total_probability(),
            "simulation engine initialised"
        );

        Ok(Self {
            actual_population: config.initial_population,
            config,
            catalog,
            cells,
            graveyard: Graveyard::new(),
            stat_report: Vec::new(),
            popul_report: Vec::new(),
            tau: 0.0,
            total_deaths: 0,
            last_stat_generation: 0,
            last_popul_generation: 0,
            rng,
        })
    }

    /// Current simulated time.
    #[must_use]
    pub fn tau(&self) -> f64 {
        self.tau
    }

    /// Population counter maintained across steps.
    #[must_use]
    pub fn actual_population(&self) -> usize {
        self.actual_population
    }

    /// Number of deaths committed so far.
    #[must_use]
    pub fn total_deaths(&self) -> usize {
        self.total_deaths
    }

    /// Read-only access to the living population.
    #[must_use]
    pub fn cells(&self) -> &CellStore {
        &self.cells
    }

    /// Read-only access to the graveyard.
    #[must_use]
    pub fn graveyard(&self) -> &Graveyard {
        &self.graveyard
    }

    /// Read-only access to the mutation catalog.
    #[must_use]
    pub fn catalog(&self) -> &MutationCatalog {
        &self.catalog
    }

    /// Statistical snapshots recorded so far, in chronological order.
    #[must_use]
    pub fn stat_report(&self) -> &[StatSnapshot] {
        &self.stat_report
    }

    /// Population snapshots recorded so far, in chronological order.
    #[must_use]
    pub fn popul_report(&self) -> &[PopulationSnapshot] {
        &self.popul_report
    }

    /// Read-only access to the configuration.
    #[must_use]
    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// Advance the simulation by one tau-leap.
    pub fn step(&mut self) {
        match self.config.sim_type {
            SimulationType::StochasticTauLeap => self.stochastic_step(),
            // Rejected at construction; kept as the dispatch point for
            // future integrators.
            SimulationType::DeterministicRk4 => {
                error!("deterministic RK4 stepping is not implemented");
            }
        }
    }

    fn stochastic_step(&mut self) {
        self.tau += self.config.tau_step;
        if !self.cells.is_empty() {
            self.advance_population();
        }
        self.record_snapshots();
    }

    fn advance_population(&mut self) {
        let tau_step = self.config.tau_step;
        let expected = self.actual_population;
        let living_ids: Vec<u32> = self.cells.iter().map(|cell| cell.id).collect();
        let population = living_ids.len();
        if population != expected {
            error!(
                expected,
                found = population,
                "living-cell enumeration does not match the population counter"
            );
        }

        // Waiting-time draws: death scaled by population density, birth by
        // the cell's own fitness. Drawn sequentially from the master stream
        // so a fixed seed fixes the whole step.
        let density = population as f64 / self.config.env_capacity as f64;
        let mut death_draws = Vec::with_capacity(population);
        for _ in 0..population {
            let draw: f64 = self.rng.sample(Exp1);
            death_draws.push(draw / density);
        }
        let mut birth_draws = Vec::with_capacity(population);
        for cell in self.cells.iter() {
            let draw: f64 = self.rng.sample(Exp1);
            birth_draws.push(draw / cell.fitness);
        }
        let decision_seed: u64 = self.rng.random();

        let catalog = &self.catalog;
        let store = self.cells.cells();
        let fates: Vec<CellFate> = store
            .par_iter()
            .enumerate()
            .map(|(index, cell)| {
                if death_draws[index] <= tau_step {
                    CellFate::Death
                } else if birth_draws[index] <= tau_step {
                    let mut decisions = decision_rng(decision_seed, index);
                    CellFate::Division {
                        daughters: divide(cell, decisions.random(), catalog),
                    }
                } else {
                    CellFate::Unchanged
                }
            })
            .collect();

        let mut dead_ids = Vec::new();
        let mut newborns = Vec::new();
        for (index, fate) in fates.into_iter().enumerate() {
            match fate {
                CellFate::Unchanged => {}
                CellFate::Death => dead_ids.push(living_ids[index]),
                CellFate::Division { daughters } => {
                    // Division is destructive: the mother dies the instant
                    // the daughters are born.
                    dead_ids.push(living_ids[index]);
                    newborns.extend(daughters);
                }
            }
        }

        // Sequential id assignment keeps ids densely packed and conflict
        // free: every id below `starting_id` is already spoken for by a
        // living or dead cell. The enumerated count, not the population
        // counter, is what preserves density if the two ever disagree.
        let births = newborns.len();
        let starting_id = (population + self.total_deaths) as u32;
        for (offset, mut cell) in newborns.into_iter().enumerate() {
            let id = starting_id + offset as u32;
            cell.id = id;
            for record in &mut cell.mutations {
                if record.origin_cell == ORIGIN_PENDING {
                    record.origin_cell = id;
                }
            }
            if !self.cells.insert(cell) {
                error!(id, "newborn cell id already present in the living store");
            }
        }
        for dead_id in &dead_ids {
            match self.cells.remove(*dead_id) {
                Some(cell) => {
                    self.graveyard.insert(
                        cell.id,
                        GraveRecord {
                            parent_id: cell.parent_id,
                            death_time: self.tau,
                        },
                    );
                }
                None => error!(id = *dead_id, "dying cell is absent from the living store"),
            }
        }

        self.total_deaths += dead_ids.len();
        self.actual_population = self.actual_population + births - dead_ids.len();
    }

    fn record_snapshots(&mut self) {
        let generation = self.tau.floor() as i64;
        if generation % i64::from(self.config.statistics_resolution) == 0
            && generation != self.last_stat_generation
        {
            self.take_stat_snapshot();
            self.last_stat_generation = generation;
        }
        if generation % i64::from(self.config.population_statistics_res) == 0
            && generation != self.last_popul_generation
        {
            self.take_population_snapshot();
            self.last_popul_generation = generation;
        }
    }

    fn take_stat_snapshot(&mut self) {
        self.stat_report
            .push(StatSnapshot::measure(self.tau, &self.cells));
    }

    fn take_population_snapshot(&mut self) {
        self.popul_report.push(PopulationSnapshot {
            generation: self.tau.floor() as i64,
            cells: self.cells.clone(),
        });
    }

    /// Execute up to `steps` tau-leaps, honouring the process-wide shutdown
    /// flag at every step boundary, then post-process into a [`Run`].
    ///
    /// A progress indicator is rendered to stderr while the loop runs; it is
    /// cosmetic and disappears on non-terminal outputs.
    pub fn run(mut self, steps: u32) -> Run {
        install_shutdown_handler();
        // Scoped init: a stale request from a previous run must not leak in.
        SHUTDOWN_REQUESTED.store(false, Ordering::SeqCst);

        let progress = indicatif::ProgressBar::with_draw_target(
            Some(u64::from(steps)),
            indicatif::ProgressDrawTarget::stderr_with_hz(10),
        );
        progress.set_style(progress_style());

        for completed in 0..steps {
            if shutdown_requested() {
                warn!(
                    completed,
                    remaining = steps - completed,
                    "shutdown requested; stopping at the step boundary"
                );
                break;
            }
            self.step();
            progress.set_message(format!("{} cells", self.cells.len()));
            progress.inc(1);
        }
        progress.finish_and_clear();

        // Boundary snapshot: make the final state visible in the report
        // even when the cadence did not land on the last generation.
        let generation = self.tau.floor() as i64;
        if generation != self.last_stat_generation {
            self.take_stat_snapshot();
            self.last_stat_generation = generation;
        }

        Run::assemble(self)
    }
}

fn progress_style() -> indicatif::ProgressStyle {
    indicatif::ProgressStyle::with_template(
        "{spinner} [{bar:50}] {percent:>3}% ~{eta} left, {pos}/{len} steps, {msg}",
    )
    .unwrap_or_else(|_| indicatif::ProgressStyle::default_bar())
    .progress_chars("#>-")
}

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);
static SHUTDOWN_HOOK: Once = Once::new();

/// True once an external shutdown (SIGINT/SIGTERM) has been requested.
#[must_use]
pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}

/// Request a graceful stop at the next step boundary.
pub fn request_shutdown() {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

/// Install the signal handlers feeding the shutdown flag. Idempotent; a
/// failed installation is logged and the run proceeds uninterruptible.
pub fn install_shutdown_handler() {
    SHUTDOWN_HOOK.call_once(|| {
        if let Err(err) = ctrlc::set_handler(|| SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst)) {
            warn!(%err, "failed to install shutdown signal handler");
        }
    });
}

/// Aggregate totals computed over a finished run.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct RunTotals {
    pub total_deaths: usize,
    /// Mutation records carried by the living population.
    pub total_mutations: usize,
    pub driver_mutations: usize,
    pub positive_mutations: usize,
    pub neutral_mutations: usize,
    pub negative_mutations: usize,
    pub average_mutations: f64,
    pub cell_memory_bytes: usize,
    pub mutation_memory_bytes: usize,
    pub graveyard_memory_bytes: usize,
}

impl RunTotals {
    /// Tally mutation counts per variant and estimate the memory footprint
    /// of the three stores.
    #[must_use]
    pub fn collect(
        cells: &CellStore,
        graveyard: &Graveyard,
        catalog: &MutationCatalog,
        total_deaths: usize,
    ) -> Self {
        let mut totals = Self {
            total_deaths,
            ..Self::default()
        };
        for cell in cells.iter() {
            totals.total_mutations += cell.mutations.len();
            for record in &cell.mutations {
                match catalog.variant_of(record.type_id) {
                    Some(MutationVariant::Driver) => totals.driver_mutations += 1,
                    Some(MutationVariant::Positive) => totals.positive_mutations += 1,
                    Some(MutationVariant::Neutral) => totals.neutral_mutations += 1,
                    Some(MutationVariant::Negative) => totals.negative_mutations += 1,
                    None => warn!(
                        type_id = record.type_id,
                        "mutation record references an unknown catalog entry"
                    ),
                }
            }
        }
        if !cells.is_empty() {
            totals.average_mutations = totals.total_mutations as f64 / cells.len() as f64;
        }
        totals.cell_memory_bytes = cells.len() * mem::size_of::<Cell>();
        totals.mutation_memory_bytes = totals.total_mutations * mem::size_of::<MutationRecord>();
        totals.graveyard_memory_bytes = graveyard.len() * mem::size_of::<(u32, GraveRecord)>();
        totals
    }

    fn log(&self, tau: f64, living_cells: usize) {
        info!(tau, living_cells, total_deaths = self.total_deaths, "simulation ended");
        info!(
            total_mutations = self.total_mutations,
            driver = self.driver_mutations,
            positive = self.positive_mutations,
            neutral = self.neutral_mutations,
            negative = self.negative_mutations,
            average_per_cell = self.average_mutations,
            "mutation totals"
        );
        let total_bytes =
            self.cell_memory_bytes + self.mutation_memory_bytes + self.graveyard_memory_bytes;
        info!(
            total_kib = total_bytes / 1024,
            cells_kib = self.cell_memory_bytes / 1024,
            mutations_kib = self.mutation_memory_bytes / 1024,
            graveyard_kib = self.graveyard_memory_bytes / 1024,
            "estimated memory footprint"
        );
    }
}

/// One node of the compressed ancestry tree, keyed by cell id.
#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct PhylogeneticNode {
    pub parent_id: u32,
    /// Number of living descendants in this node's subtree; a living cell
    /// counts itself.
    pub child_sum: u32,
    /// Zero while the cell is still alive.
    pub death_time: f64,
}

/// Rooted ancestry tree over cell ids, with pass-through nodes compressed
/// away so roughly one node per lineage split remains.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct PhylogeneticTree {
    nodes: HashMap<u32, PhylogeneticNode>,
}

impl PhylogeneticTree {
    /// Reconstruct and compress the ancestry of every living cell.
    #[must_use]
    pub fn build(cells: &CellStore, graveyard: &Graveyard) -> Self {
        let mut tree = Self::default();
        tree.nodes.insert(
            ROOT_CELL_ID,
            PhylogeneticNode {
                parent_id: ROOT_CELL_ID,
                child_sum: 0,
                death_time: 0.0,
            },
        );

        for cell in cells.iter() {
            let mut current = cell.id;
            loop {
                let parent = tree.touch(current, cells, graveyard);
                if current == ROOT_CELL_ID {
                    break;
                }
                current = parent;
            }
        }
        debug!(nodes = tree.nodes.len(), "ancestry reconstruction finished");

        let removed = tree.compress(cells);
        debug!(
            nodes = tree.nodes.len(),
            removed, "phylogenetic tree compressed"
        );
        tree
    }

    /// Number of nodes, the synthetic root included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[must_use]
    pub fn contains(&self, id: u32) -> bool {
        self.nodes.contains_key(&id)
    }

    #[must_use]
    pub fn get(&self, id: u32) -> Option<&PhylogeneticNode> {
        self.nodes.get(&id)
    }

    /// Borrow the full node map.
    #[must_use]
    pub fn nodes(&self) -> &HashMap<u32, PhylogeneticNode> {
        &self.nodes
    }

    /// Ensure a node exists for `id`, bump its child sum, and return its
    /// parent id. Node data comes from the graveyard for dead ancestors and
    /// from the living store otherwise.
    fn touch(&mut self, id: u32, cells: &CellStore, graveyard: &Graveyard) -> u32 {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.child_sum += 1;
            return node.parent_id;
        }
        let node = if let Some(record) = graveyard.get(id) {
            PhylogeneticNode {
                parent_id: record.parent_id,
                child_sum: 1,
                death_time: record.death_time,
            }
        } else if let Some(cell) = cells.get(id) {
            PhylogeneticNode {
                parent_id: cell.parent_id,
                child_sum: 1,
                death_time: 0.0,
            }
        } else {
            error!(
                id,
                "cell absent from both the living store and the graveyard during the ancestry walk"
            );
            PhylogeneticNode {
                parent_id: ROOT_CELL_ID,
                child_sum: 1,
                death_time: 0.0,
            }
        };
        let parent = node.parent_id;
        self.nodes.insert(id, node);
        parent
    }

    /// Remove pass-through ancestors: a dead ancestor whose child sum equals
    /// its descendant's contributed no branching. Each affected descendant is
    /// re-linked to its first ancestor with a strictly larger child sum (or
    /// the root). Idempotent. Returns the number of removed nodes.
    pub fn compress(&mut self, cells: &CellStore) -> usize {
        let mut visited: HashSet<u32> = HashSet::with_capacity(self.nodes.len());
        let mut marked: Vec<u32> = Vec::new();

        for cell in cells.iter() {
            let mut current = cell.id;
            while current != ROOT_CELL_ID {
                if !visited.insert(current) {
                    break;
                }
                let Some(node) = self.nodes.get(&current).copied() else {
                    error!(id = current, "node missing during the compression walk");
                    break;
                };
                let mut parent_id = node.parent_id;
                if parent_id == ROOT_CELL_ID {
                    break;
                }
                let Some(parent) = self.nodes.get(&parent_id).copied() else {
                    error!(id = parent_id, "parent node missing during the compression walk");
                    break;
                };
                if parent.child_sum == node.child_sum {
                    marked.push(parent_id);
                    let mut next = parent.parent_id;
                    while next != ROOT_CELL_ID {
                        let Some(ancestor) = self.nodes.get(&next).copied() else {
                            error!(id = next, "ancestor node missing during the compression walk");
                            break;
                        };
                        if ancestor.child_sum > node.child_sum {
                            break;
                        }
                        marked.push(next);
                        next = ancestor.parent_id;
                    }
                    if let Some(entry) = self.nodes.get_mut(&current) {
                        entry.parent_id = next;
                    }
                    parent_id = next;
                }
                current = parent_id;
            }
        }

        let mut removed = 0;
        for id in marked {
            if self.nodes.remove(&id).is_some() {
                removed += 1;
            }
        }
        removed
    }
}

/// Everything a finished simulation hands to external collaborators.
#[derive(Debug)]
pub struct Run {
    pub cells: CellStore,
    pub catalog: MutationCatalog,
    pub graveyard: Graveyard,
    pub phylogenetic_tree: PhylogeneticTree,
    pub stat_report: Vec<StatSnapshot>,
    pub popul_report: Vec<PopulationSnapshot>,
    pub totals: RunTotals,
    /// Simulated time at termination.
    pub tau: f64,
}

impl Run {
    fn assemble(simulation: Simulation) -> Self {
        let Simulation {
            catalog,
            cells,
            graveyard,
            stat_report,
            popul_report,
            tau,
            total_deaths,
            ..
        } = simulation;

        let totals = RunTotals::collect(&cells, &graveyard, &catalog, total_deaths);
        totals.log(tau, cells.len());
        audit_stores(&cells, &graveyard, total_deaths);
        let phylogenetic_tree = PhylogeneticTree::build(&cells, &graveyard);

        Self {
            cells,
            catalog,
            graveyard,
            phylogenetic_tree,
            stat_report,
            popul_report,
            totals,
            tau,
        }
    }
}

/// Post-run correctness audit. Findings are logged at error level and never
/// abort: a violated invariant here is an engine bug, not a user error, and
/// the partial results are still worth emitting.
pub fn audit_stores(cells: &CellStore, graveyard: &Graveyard, total_deaths: usize) {
    let mut seen = HashSet::with_capacity(cells.len() + graveyard.len());
    let mut max_id: Option<u32> = None;

    for cell in cells.iter() {
        if !seen.insert(cell.id) {
            error!(id = cell.id, "duplicate cell id in the living store");
        }
        max_id = Some(max_id.map_or(cell.id, |max| max.max(cell.id)));
    }
    for (id, _) in graveyard.iter() {
        if !seen.insert(*id) {
            error!(id = *id, "cell id present in both the living store and the graveyard");
        }
        max_id = Some(max_id.map_or(*id, |max| max.max(*id)));
    }

    let accounted = cells.len() + graveyard.len();
    if let Some(max_id) = max_id {
        if accounted != max_id as usize + 1 {
            error!(max_id, accounted, "cell ids are not densely allocated");
        }
    }
    if total_deaths != graveyard.len() {
        error!(
            total_deaths,
            graveyard = graveyard.len(),
            "death counter does not match the graveyard"
        );
    }
}
