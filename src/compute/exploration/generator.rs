//! Pseudo-material generation: random seeds and strength-scaled mutation.

use rand::prelude::*;

use crate::schema::{AtomSite, AtomType, Structure, StructureLimits};

/// Random number generator wrapper for structure operations.
pub struct StructureRng {
    rng: StdRng,
}

impl StructureRng {
    /// Create from seed.
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Generator for one generation of a run seeded with `base`. Resumed
    /// runs draw the same sequence as uninterrupted ones.
    pub fn for_generation(base: u64, generation: u32) -> Self {
        Self::new(base ^ u64::from(generation).wrapping_mul(0x9E37_79B9_7F4A_7C15))
    }

    /// Draw a seed for a derived generator.
    pub fn next_seed(&mut self) -> u64 {
        self.rng.r#gen()
    }

    /// Access the underlying RNG.
    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    /// Uniform random in bounds.
    fn uniform(&mut self, bounds: (f64, f64)) -> f64 {
        if bounds.0 >= bounds.1 {
            return bounds.0;
        }
        self.rng.gen_range(bounds.0..=bounds.1)
    }

    /// Generate a random structure within limits.
    pub fn random_structure(&mut self, limits: &StructureLimits) -> Structure {
        let a = self.uniform(limits.lattice_constant_limits);
        let b = self.uniform(limits.lattice_constant_limits);
        let c = self.uniform(limits.lattice_constant_limits);

        let atom_types: Vec<AtomType> = (0..limits.number_of_atom_types)
            .map(|_| AtomType {
                epsilon: self.uniform(limits.epsilon_limits),
                sigma: self.uniform(limits.sigma_limits),
            })
            .collect();

        let volume = a * b * c;
        let density = self.uniform(limits.number_density_limits);
        let count = atom_count(density, volume);

        let mut atom_sites: Vec<AtomSite> = (0..count)
            .map(|_| self.random_site(limits.number_of_atom_types))
            .collect();
        self.assign_charges(&mut atom_sites, limits.charge_limit);

        Structure {
            a,
            b,
            c,
            atom_types,
            atom_sites,
            number_density: count as f64 / volume,
        }
    }

    fn random_site(&mut self, number_of_atom_types: usize) -> AtomSite {
        AtomSite {
            atom_type: self.rng.gen_range(0..number_of_atom_types.max(1)),
            x: self.rng.r#gen(),
            y: self.rng.r#gen(),
            z: self.rng.r#gen(),
            q: 0.0,
        }
    }

    /// Move charge between random site pairs; net charge stays zero and
    /// every `|q|` stays within `limit`.
    fn assign_charges(&mut self, sites: &mut [AtomSite], limit: f64) {
        if limit <= 0.0 || sites.len() < 2 {
            return;
        }
        for i in 0..sites.len() {
            let j = self.rng.gen_range(0..sites.len());
            if i == j {
                continue;
            }
            // Room for +dq on i and -dq on j.
            let room_i = limit - sites[i].q;
            let room_j = limit + sites[j].q;
            let room = room_i.min(room_j);
            if room <= 0.0 {
                continue;
            }
            let dq = self.rng.gen_range(0.0..=room);
            sites[i].q += dq;
            sites[j].q -= dq;
        }
    }

    /// Mutate a parent structure with the given strength.
    ///
    /// Lattice constants and number density move by a uniform amount within
    /// `±strength` of their limit span. Lennard-Jones parameters move
    /// `strength` of the way toward a fresh random value. Atom sites move
    /// `strength` of the periodic minimum distance toward a random point;
    /// surplus sites are dropped and missing ones added at random.
    pub fn mutate_structure(
        &mut self,
        parent: &Structure,
        strength: f64,
        limits: &StructureLimits,
    ) -> Structure {
        let lattice_span = limits.lattice_constant_limits.1 - limits.lattice_constant_limits.0;
        let a = self.perturb(parent.a, strength * lattice_span, limits.lattice_constant_limits);
        let b = self.perturb(parent.b, strength * lattice_span, limits.lattice_constant_limits);
        let c = self.perturb(parent.c, strength * lattice_span, limits.lattice_constant_limits);

        let atom_types: Vec<AtomType> = parent
            .atom_types
            .iter()
            .map(|t| AtomType {
                epsilon: toward(t.epsilon, self.uniform(limits.epsilon_limits), strength)
                    .clamp(limits.epsilon_limits.0, limits.epsilon_limits.1),
                sigma: toward(t.sigma, self.uniform(limits.sigma_limits), strength)
                    .clamp(limits.sigma_limits.0, limits.sigma_limits.1),
            })
            .collect();

        let density_span = limits.number_density_limits.1 - limits.number_density_limits.0;
        let density = self.perturb(
            parent.number_density,
            strength * density_span,
            limits.number_density_limits,
        );
        let volume = a * b * c;
        let count = atom_count(density, volume);

        let kept = count.min(parent.atom_sites.len());
        let mut atom_sites: Vec<AtomSite> = parent
            .atom_sites
            .choose_multiple(&mut self.rng, kept)
            .cloned()
            .collect();

        for site in &mut atom_sites {
            let (tx, ty, tz) = (self.rng.r#gen(), self.rng.r#gen(), self.rng.r#gen());
            site.x = periodic_step(site.x, tx, strength);
            site.y = periodic_step(site.y, ty, strength);
            site.z = periodic_step(site.z, tz, strength);
        }

        let type_count = atom_types.len();
        while atom_sites.len() < count {
            atom_sites.push(self.random_site(type_count));
        }

        Structure {
            a,
            b,
            c,
            atom_types,
            atom_sites,
            number_density: density,
        }
    }

    /// Uniform perturbation within `±max_change`, clamped to bounds.
    fn perturb(&mut self, value: f64, max_change: f64, bounds: (f64, f64)) -> f64 {
        let delta = if max_change > 0.0 {
            self.rng.gen_range(-max_change..=max_change)
        } else {
            0.0
        };
        (value + delta).clamp(bounds.0, bounds.1)
    }
}

/// Atoms for a density in a volume, at least one.
fn atom_count(density: f64, volume: f64) -> usize {
    ((density * volume).round() as usize).max(1)
}

fn toward(from: f64, target: f64, strength: f64) -> f64 {
    from + strength * (target - from)
}

/// Move fractional coordinate `from` by `strength` of the shortest periodic
/// distance toward `toward`, crossing the cell boundary when that is the
/// short way. The result lies in `[0, 1)`.
pub fn periodic_step(from: f64, toward: f64, strength: f64) -> f64 {
    let direct = toward - from;
    let distance = direct.abs().min(1.0 - direct.abs());
    let direction = if direct.abs() <= 0.5 {
        direct.signum()
    } else {
        -direct.signum()
    };
    let wrapped = (from + direction * strength * distance).rem_euclid(1.0);
    if wrapped >= 1.0 { 0.0 } else { wrapped }
}
