//! UAV selection strategies.
//!
//! Every strategy returns an ordered list of chosen vehicle ids and is
//! deterministic for a fixed seed: the stochastic searches run on a
//! `StdRng` seeded by the caller.

use crate::error::{CoreError, CoreResult};
use crate::types::{haversine_m, Area, GeoPoint};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

/// Assigner view of a vehicle.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub uav_id: String,
    pub max_altitude_m: f64,
    pub max_speed_mps: f64,
    pub battery_ratio: f64,
    pub max_payload_kg: f64,
    pub position: Option<GeoPoint>,
    pub workload: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectiveKind {
    MinimizeCost,
    MaximizeBattery,
    MinimizeTime,
    MaximizeCoverage,
}

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct Objective {
    pub kind: ObjectiveKind,
    pub weight: f64,
}

/// Hard constraints applied before the multi-objective search.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Constraint {
    /// Vehicle ceiling must reach the area's max altitude.
    Altitude,
    /// Minimum remaining battery fraction.
    Battery { min_ratio: f64 },
    /// Minimum payload capacity in kilograms.
    Payload { required_kg: f64 },
}

#[derive(Debug, Clone)]
pub struct GeneticParams {
    pub population_size: usize,
    pub generations: usize,
    pub mutation_rate: f64,
    pub crossover_rate: f64,
    pub elite_size: usize,
}

impl Default for GeneticParams {
    fn default() -> Self {
        Self {
            population_size: 50,
            generations: 100,
            mutation_rate: 0.1,
            crossover_rate: 0.8,
            elite_size: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PsoParams {
    pub swarm_size: usize,
    pub iterations: usize,
    /// Inertia weight.
    pub w: f64,
    /// Cognitive factor.
    pub c1: f64,
    /// Social factor.
    pub c2: f64,
}

impl Default for PsoParams {
    fn default() -> Self {
        Self {
            swarm_size: 30,
            iterations: 100,
            w: 0.7,
            c1: 1.5,
            c2: 1.5,
        }
    }
}

#[derive(Debug, Clone)]
pub enum AssignStrategy {
    /// Top-k by `0.7 * battery + 0.3 * altitude fit`, rejecting vehicles
    /// that cannot reach the required altitude.
    Greedy,
    /// Closest vehicle(s) to the polygon centroid.
    Proximity,
    Genetic(GeneticParams),
    ParticleSwarm(PsoParams),
    MultiObjective {
        objectives: Vec<Objective>,
        constraints: Vec<Constraint>,
        params: GeneticParams,
    },
}

/// Choose `count` vehicles for the area.
pub fn assign(
    strategy: &AssignStrategy,
    area: &Area,
    count: usize,
    candidates: &[Candidate],
    seed: u64,
) -> CoreResult<Vec<String>> {
    if count == 0 {
        return Err(CoreError::Validation("assignment count must be positive".into()));
    }
    if candidates.is_empty() {
        return Err(CoreError::CapacityExhausted("no candidate UAVs".into()));
    }

    match strategy {
        AssignStrategy::Greedy => Ok(assign_greedy(area, count, candidates)),
        AssignStrategy::Proximity => Ok(assign_proximity(area, count, candidates)),
        AssignStrategy::Genetic(params) => {
            Ok(assign_genetic(area, count, candidates, params, seed))
        }
        AssignStrategy::ParticleSwarm(params) => {
            Ok(assign_pso(area, count, candidates, params, seed))
        }
        AssignStrategy::MultiObjective {
            objectives,
            constraints,
            params,
        } => assign_multi_objective(area, count, candidates, objectives, constraints, params, seed),
    }
}

fn altitude_fit(candidate: &Candidate, area: &Area) -> f64 {
    if area.max_altitude <= 0.0 {
        return 1.0;
    }
    (candidate.max_altitude_m / area.max_altitude).min(1.0)
}

fn assign_greedy(area: &Area, count: usize, candidates: &[Candidate]) -> Vec<String> {
    let mut scored: Vec<(&Candidate, f64)> = candidates
        .iter()
        .filter(|c| c.max_altitude_m >= area.max_altitude)
        .map(|c| (c, 0.7 * c.battery_ratio + 0.3 * altitude_fit(c, area)))
        .collect();
    // Stable order: score descending, id ascending as tiebreaker.
    scored.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.uav_id.cmp(&b.0.uav_id))
    });
    scored
        .into_iter()
        .take(count)
        .map(|(c, _)| c.uav_id.clone())
        .collect()
}

fn assign_proximity(area: &Area, count: usize, candidates: &[Candidate]) -> Vec<String> {
    let center = area.centroid();
    let mut with_distance: Vec<(&Candidate, f64)> = candidates
        .iter()
        .map(|c| {
            let d = c
                .position
                .map_or(f64::INFINITY, |p| haversine_m(&center, &p));
            (c, d)
        })
        .collect();
    with_distance.sort_by(|a, b| {
        a.1.partial_cmp(&b.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.uav_id.cmp(&b.0.uav_id))
    });
    with_distance
        .into_iter()
        .take(count)
        .map(|(c, _)| c.uav_id.clone())
        .collect()
}

/// Mean member fitness: battery and altitude fit.
fn individual_fitness(individual: &[usize], area: &Area, candidates: &[Candidate]) -> f64 {
    if individual.is_empty() {
        return 0.0;
    }
    let total: f64 = individual
        .iter()
        .map(|&i| {
            let c = &candidates[i];
            0.6 * c.battery_ratio + 0.4 * altitude_fit(c, area)
        })
        .sum();
    total / individual.len() as f64
}

fn random_individual(rng: &mut StdRng, pool: usize, count: usize) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..pool).collect();
    indices.shuffle(rng);
    indices.truncate(count);
    indices
}

fn tournament_select<'a>(
    rng: &mut StdRng,
    population: &'a [Vec<usize>],
    fitness: &[f64],
) -> &'a Vec<usize> {
    const TOURNAMENT_SIZE: usize = 3;
    let mut best: Option<usize> = None;
    for _ in 0..TOURNAMENT_SIZE {
        let idx = rng.gen_range(0..population.len());
        if best.map_or(true, |b| fitness[idx] > fitness[b]) {
            best = Some(idx);
        }
    }
    &population[best.unwrap_or(0)]
}

/// Single-point crossover with order-preserving de-duplication; refills
/// from unused indices when the child comes up short.
fn crossover(rng: &mut StdRng, p1: &[usize], p2: &[usize], pool: usize) -> Vec<usize> {
    if p1.len() < 2 {
        return p1.to_vec();
    }
    let point = rng.gen_range(1..p1.len());
    let mut child: Vec<usize> = Vec::with_capacity(p1.len());
    for &g in p1[..point].iter().chain(p2[point..].iter()) {
        if !child.contains(&g) {
            child.push(g);
        }
    }
    while child.len() < p1.len() {
        let remaining: Vec<usize> = (0..pool).filter(|i| !child.contains(i)).collect();
        match remaining.as_slice() {
            [] => break,
            rest => child.push(rest[rng.gen_range(0..rest.len())]),
        }
    }
    child.truncate(p1.len());
    child
}

/// Point mutation: swap one member for an unused candidate.
fn mutate(rng: &mut StdRng, individual: &mut [usize], pool: usize) {
    if individual.is_empty() {
        return;
    }
    let slot = rng.gen_range(0..individual.len());
    let unused: Vec<usize> = (0..pool).filter(|i| !individual.contains(i)).collect();
    if !unused.is_empty() {
        individual[slot] = unused[rng.gen_range(0..unused.len())];
    }
}

fn assign_genetic(
    area: &Area,
    count: usize,
    candidates: &[Candidate],
    params: &GeneticParams,
    seed: u64,
) -> Vec<String> {
    if candidates.len() <= count {
        return candidates.iter().map(|c| c.uav_id.clone()).collect();
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let pool = candidates.len();

    let mut population: Vec<Vec<usize>> = (0..params.population_size)
        .map(|_| random_individual(&mut rng, pool, count))
        .collect();

    for _ in 0..params.generations {
        let fitness: Vec<f64> = population
            .iter()
            .map(|ind| individual_fitness(ind, area, candidates))
            .collect();

        // Elites carry over unchanged.
        let mut ranked: Vec<usize> = (0..population.len()).collect();
        ranked.sort_by(|&a, &b| {
            fitness[b]
                .partial_cmp(&fitness[a])
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let mut next: Vec<Vec<usize>> = ranked
            .iter()
            .take(params.elite_size)
            .map(|&i| population[i].clone())
            .collect();

        while next.len() < params.population_size {
            let p1 = tournament_select(&mut rng, &population, &fitness).clone();
            let p2 = tournament_select(&mut rng, &population, &fitness).clone();
            let mut child = if rng.gen::<f64>() < params.crossover_rate {
                crossover(&mut rng, &p1, &p2, pool)
            } else {
                p1
            };
            if rng.gen::<f64>() < params.mutation_rate {
                mutate(&mut rng, &mut child, pool);
            }
            next.push(child);
        }
        population = next;
    }

    let best = population
        .iter()
        .max_by(|a, b| {
            individual_fitness(a, area, candidates)
                .partial_cmp(&individual_fitness(b, area, candidates))
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .cloned()
        .unwrap_or_default();
    best.iter().map(|&i| candidates[i].uav_id.clone()).collect()
}

fn assign_pso(
    area: &Area,
    count: usize,
    candidates: &[Candidate],
    params: &PsoParams,
    seed: u64,
) -> Vec<String> {
    if candidates.len() <= count {
        return candidates.iter().map(|c| c.uav_id.clone()).collect();
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let pool = candidates.len();

    struct Particle {
        position: Vec<usize>,
        velocity: Vec<f64>,
        best_position: Vec<usize>,
        best_fitness: f64,
    }

    // Discrete "difference" between two candidate indices, normalised by
    // the candidate count.
    let position_diff = |a: usize, b: usize| -> f64 {
        if pool == 0 {
            0.0
        } else {
            (b as f64 - a as f64) / pool as f64
        }
    };

    let mut particles: Vec<Particle> = Vec::with_capacity(params.swarm_size);
    let mut global_best: Vec<usize> = Vec::new();
    let mut global_best_fitness = f64::NEG_INFINITY;

    for _ in 0..params.swarm_size {
        let position = random_individual(&mut rng, pool, count);
        let velocity: Vec<f64> = (0..count).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let fitness = individual_fitness(&position, area, candidates);
        if fitness > global_best_fitness {
            global_best_fitness = fitness;
            global_best = position.clone();
        }
        particles.push(Particle {
            best_position: position.clone(),
            best_fitness: fitness,
            position,
            velocity,
        });
    }

    for _ in 0..params.iterations {
        for particle in &mut particles {
            for i in 0..particle.position.len() {
                let r1: f64 = rng.gen();
                let r2: f64 = rng.gen();
                let personal = particle
                    .best_position
                    .get(i)
                    .copied()
                    .unwrap_or(particle.position[i]);
                let social = global_best.get(i).copied().unwrap_or(particle.position[i]);

                particle.velocity[i] = params.w * particle.velocity[i]
                    + params.c1 * r1 * position_diff(particle.position[i], personal)
                    + params.c2 * r2 * position_diff(particle.position[i], social);

                if particle.velocity[i].abs() > 0.5 {
                    let unused: Vec<usize> =
                        (0..pool).filter(|j| !particle.position.contains(j)).collect();
                    if !unused.is_empty() {
                        particle.position[i] = unused[rng.gen_range(0..unused.len())];
                    }
                }
            }

            let fitness = individual_fitness(&particle.position, area, candidates);
            if fitness > particle.best_fitness {
                particle.best_fitness = fitness;
                particle.best_position = particle.position.clone();
            }
            if fitness > global_best_fitness {
                global_best_fitness = fitness;
                global_best = particle.position.clone();
            }
        }
    }

    global_best
        .iter()
        .map(|&i| candidates[i].uav_id.clone())
        .collect()
}

// ---------------------------------------------------------------------------
// Multi-objective (non-dominated sorting with crowding distance)
// ---------------------------------------------------------------------------

fn satisfies(candidate: &Candidate, area: &Area, constraints: &[Constraint]) -> bool {
    constraints.iter().all(|c| match c {
        Constraint::Altitude => candidate.max_altitude_m >= area.max_altitude,
        Constraint::Battery { min_ratio } => candidate.battery_ratio >= *min_ratio,
        Constraint::Payload { required_kg } => candidate.max_payload_kg >= *required_kg,
    })
}

/// Rough traversal time across the area's bounding-box diagonal.
fn estimate_mission_time_secs(candidate: &Candidate, area: &Area) -> f64 {
    let bb = area.bounding_box();
    let mid_lat = (bb.min_lat + bb.max_lat) / 2.0;
    let lat_m = (bb.max_lat - bb.min_lat) * crate::types::METERS_PER_DEGREE;
    let lon_m =
        (bb.max_lon - bb.min_lon) * crate::types::METERS_PER_DEGREE * mid_lat.to_radians().cos();
    let distance = lat_m.hypot(lon_m);
    if candidate.max_speed_mps > 0.0 {
        distance / candidate.max_speed_mps
    } else {
        f64::INFINITY
    }
}

/// Objective vector, every entry oriented for minimisation.
fn objective_vector(
    individual: &[usize],
    area: &Area,
    candidates: &[Candidate],
    objectives: &[Objective],
) -> Vec<f64> {
    objectives
        .iter()
        .map(|o| match o.kind {
            ObjectiveKind::MinimizeCost => {
                let cost: f64 = individual
                    .iter()
                    .map(|&i| 1.0 - candidates[i].battery_ratio)
                    .sum();
                cost * o.weight
            }
            ObjectiveKind::MaximizeBattery => {
                let battery: f64 = individual.iter().map(|&i| candidates[i].battery_ratio).sum();
                -battery * o.weight
            }
            ObjectiveKind::MinimizeTime => {
                let time: f64 = individual
                    .iter()
                    .map(|&i| estimate_mission_time_secs(&candidates[i], area))
                    .sum();
                time * o.weight
            }
            ObjectiveKind::MaximizeCoverage => -(individual.len() as f64) * o.weight,
        })
        .collect()
}

fn dominates(a: &[f64], b: &[f64]) -> bool {
    let mut strictly_better = false;
    for (x, y) in a.iter().zip(b.iter()) {
        if x > y {
            return false;
        }
        if x < y {
            strictly_better = true;
        }
    }
    strictly_better
}

/// Indices of the population grouped into non-dominated fronts.
fn non_dominated_sort(scores: &[Vec<f64>]) -> Vec<Vec<usize>> {
    let n = scores.len();
    let mut domination_count = vec![0usize; n];
    let mut dominated: Vec<Vec<usize>> = vec![Vec::new(); n];

    for i in 0..n {
        for j in (i + 1)..n {
            if dominates(&scores[i], &scores[j]) {
                dominated[i].push(j);
                domination_count[j] += 1;
            } else if dominates(&scores[j], &scores[i]) {
                dominated[j].push(i);
                domination_count[i] += 1;
            }
        }
    }

    let mut fronts: Vec<Vec<usize>> = Vec::new();
    let mut current: Vec<usize> = (0..n).filter(|&i| domination_count[i] == 0).collect();
    while !current.is_empty() {
        let mut next = Vec::new();
        for &i in &current {
            for &j in &dominated[i] {
                domination_count[j] -= 1;
                if domination_count[j] == 0 {
                    next.push(j);
                }
            }
        }
        fronts.push(std::mem::replace(&mut current, next));
    }
    fronts
}

/// Crowding distance within one front; larger is better.
fn crowding_distances(front: &[usize], scores: &[Vec<f64>]) -> Vec<f64> {
    let mut distance = vec![0.0f64; front.len()];
    if front.len() <= 2 {
        return vec![f64::INFINITY; front.len()];
    }
    let objectives = scores[front[0]].len();
    for m in 0..objectives {
        let mut order: Vec<usize> = (0..front.len()).collect();
        order.sort_by(|&a, &b| {
            scores[front[a]][m]
                .partial_cmp(&scores[front[b]][m])
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        distance[order[0]] = f64::INFINITY;
        distance[order[front.len() - 1]] = f64::INFINITY;
        let span = scores[front[order[front.len() - 1]]][m] - scores[front[order[0]]][m];
        if span <= 0.0 {
            continue;
        }
        for k in 1..front.len() - 1 {
            let prev = scores[front[order[k - 1]]][m];
            let next = scores[front[order[k + 1]]][m];
            distance[order[k]] += (next - prev) / span;
        }
    }
    distance
}

#[allow(clippy::too_many_arguments)]
fn assign_multi_objective(
    area: &Area,
    count: usize,
    candidates: &[Candidate],
    objectives: &[Objective],
    constraints: &[Constraint],
    params: &GeneticParams,
    seed: u64,
) -> CoreResult<Vec<String>> {
    if objectives.is_empty() {
        return Err(CoreError::Validation(
            "multi-objective assignment needs at least one objective".into(),
        ));
    }

    let feasible: Vec<Candidate> = candidates
        .iter()
        .filter(|c| satisfies(c, area, constraints))
        .cloned()
        .collect();
    if feasible.is_empty() {
        return Err(CoreError::CapacityExhausted(
            "no candidate satisfies the constraint set".into(),
        ));
    }
    if feasible.len() <= count {
        return Ok(feasible.iter().map(|c| c.uav_id.clone()).collect());
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let pool = feasible.len();

    let mut population: Vec<Vec<usize>> = (0..params.population_size)
        .map(|_| random_individual(&mut rng, pool, count))
        .collect();

    for _ in 0..params.generations {
        let scores: Vec<Vec<f64>> = population
            .iter()
            .map(|ind| objective_vector(ind, area, &feasible, objectives))
            .collect();
        let fronts = non_dominated_sort(&scores);

        // Environmental selection: fill from the best fronts, break the
        // last one by crowding distance.
        let mut selected: Vec<Vec<usize>> = Vec::with_capacity(params.population_size);
        for front in &fronts {
            if selected.len() + front.len() <= params.population_size {
                selected.extend(front.iter().map(|&i| population[i].clone()));
            } else {
                let crowding = crowding_distances(front, &scores);
                let mut order: Vec<usize> = (0..front.len()).collect();
                order.sort_by(|&a, &b| {
                    crowding[b]
                        .partial_cmp(&crowding[a])
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
                for &k in order.iter().take(params.population_size - selected.len()) {
                    selected.push(population[front[k]].clone());
                }
                break;
            }
        }

        // Rank-based scalar fitness drives the tournament.
        let rank_fitness: Vec<f64> = {
            let sel_scores: Vec<Vec<f64>> = selected
                .iter()
                .map(|ind| objective_vector(ind, area, &feasible, objectives))
                .collect();
            let sel_fronts = non_dominated_sort(&sel_scores);
            let mut ranks = vec![0.0; selected.len()];
            for (depth, front) in sel_fronts.iter().enumerate() {
                for &i in front {
                    ranks[i] = -(depth as f64);
                }
            }
            ranks
        };

        let mut offspring: Vec<Vec<usize>> = Vec::with_capacity(params.population_size);
        while offspring.len() < params.population_size {
            let p1 = tournament_select(&mut rng, &selected, &rank_fitness).clone();
            let p2 = tournament_select(&mut rng, &selected, &rank_fitness).clone();
            let mut child = if rng.gen::<f64>() < params.crossover_rate {
                crossover(&mut rng, &p1, &p2, pool)
            } else {
                p1
            };
            if rng.gen::<f64>() < params.mutation_rate {
                mutate(&mut rng, &mut child, pool);
            }
            offspring.push(child);
        }
        population = offspring;
    }

    let scores: Vec<Vec<f64>> = population
        .iter()
        .map(|ind| objective_vector(ind, area, &feasible, objectives))
        .collect();
    let fronts = non_dominated_sort(&scores);
    let head = fronts
        .first()
        .and_then(|front| front.first())
        .map(|&i| population[i].clone())
        .unwrap_or_default();

    Ok(head.iter().map(|&i| feasible[i].uav_id.clone()).collect())
}
