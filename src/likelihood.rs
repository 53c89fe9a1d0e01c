use std::ops::Bound::Excluded;
use std::ops::Bound::Unbounded;

use tracing::debug;

use crate::arg::Arg;
use crate::smc::SmcSampler;
use crate::tree::Tree;
use crate::Position;

impl Arg {
    /// Log prior of the graph under SMC' with per-base recombination
    /// rate `r`: the coalescent prior of the first tree, a Poisson
    /// arrival term per bin and a transition term per breakpoint.
    ///
    /// Needs [`Arg::discretize`] to have run.
    pub fn smc_prior_likelihood(&self, r: f64) -> f64 {
        let mut tree = self.get_tree_at(Position::ZERO);
        let mut log_likelihood = tree.prior_likelihood(&self.nodes);
        let mut tree_length = tree.length(&self.nodes);
        let mut events = self
            .recombinations
            .range((Excluded(Position::ZERO), Unbounded))
            .peekable();
        for w in self.coordinates.windows(2) {
            let (bin_start, bin_end) = (w[0], w[1]);
            let rho = (bin_end - bin_start) * r * self.ne;
            log_likelihood -= rho * tree_length;
            if let Some((_, event)) = events.next_if(|&(&pos, _)| pos.value() == bin_start) {
                log_likelihood += (rho * tree_length).ln();
                log_likelihood += tree.transition_likelihood(&self.nodes, event);
                tree.forward_update(event);
                tree_length = tree.length(&self.nodes);
                assert!(tree_length > 0.0, "empty tree at {bin_start}");
            }
            assert!(!log_likelihood.is_nan());
        }
        log_likelihood
    }

    /// Log likelihood of the node states with per-base mutation rate
    /// `m`. Each site occupies one base and carries a mutation on
    /// every mapped edge. The rest of the sequence carries none.
    pub fn data_likelihood(&self, m: f64) -> f64 {
        let theta = m * self.ne;
        let length = self.sequence_length;
        let mut tree = Tree::new();
        let mut events = self.recombinations.iter().peekable();
        let mut cursor = 0.0;
        let mut log_likelihood = 0.0;

        let gap = |tree: &Tree, from: f64, to: f64| {
            if to > from {
                tree.null_likelihood(&self.nodes, theta * (to - from))
            } else {
                0.0
            }
        };

        let sites = self
            .mutation_sites
            .iter()
            .copied()
            .filter(|x| x.value() < length);
        for x in sites {
            while let Some((&pos, event)) = events.next_if(|&(&pos, _)| pos <= x) {
                log_likelihood += gap(&tree, cursor, pos.value());
                cursor = f64::max(cursor, pos.value());
                tree.forward_update(event);
            }
            log_likelihood += gap(&tree, cursor, x.value());
            log_likelihood += tree.data_likelihood(&self.nodes, theta, x);
            cursor = x.value() + 1.0;
        }
        for (&pos, event) in events {
            let next = pos.value().min(length);
            log_likelihood += gap(&tree, cursor, next);
            cursor = f64::max(cursor, next);
            if pos.value() >= length {
                break;
            }
            tree.forward_update(event);
        }
        log_likelihood += gap(&tree, cursor, length);
        log_likelihood
    }

    pub fn smc_likelihood(&self, r: f64, m: f64) -> f64 {
        self.smc_prior_likelihood(r) + self.data_likelihood(m)
    }

    /// Sample the start times of the events inside the rewired span
    /// from their SMC' densities. Valid events below the cut time
    /// are kept.
    pub fn smc_sample_recombinations(&mut self) {
        let sampler = SmcSampler::new();
        let mut tree = self.start_tree.clone();
        let (start, end) = (self.start, self.end);
        let mut sampled = 0;
        for (&pos, r) in self
            .recombinations
            .range_mut((Excluded(start), Unbounded))
            .take_while(|&(&pos, _)| pos < end)
        {
            if !r.is_boundary() && pos.value() < self.sequence_length {
                sampler.sample_recombination(r, self.cut_time, &tree, &self.nodes, &mut self.rng);
                sampled += 1;
            }
            tree.forward_update(r);
        }
        debug!(sampled, "sampled recombination times");
    }

    /// Assign every breakpoint a source and start time, keeping
    /// those that are valid and below the cut time.
    pub fn approx_sample_recombinations(&mut self) {
        let sampler = SmcSampler::new();
        let length = self.length_pos();
        for (_, r) in self
            .recombinations
            .range_mut((Excluded(Position::ZERO), Unbounded))
            .take_while(|&(&pos, _)| pos < length)
        {
            sampler.approx_sample_recombination(r, self.cut_time, &self.nodes, &mut self.rng);
        }
    }

    /// Resample the start time of every breakpoint whose current
    /// one is invalid.
    pub fn adjust_recombinations(&mut self) {
        let sampler = SmcSampler::new();
        let length = self.length_pos();
        for (_, r) in self
            .recombinations
            .range_mut((Excluded(Position::ZERO), Unbounded))
            .take_while(|&(&pos, _)| pos < length)
        {
            sampler.adjust(r, 0.0, &self.nodes, &mut self.rng);
        }
    }
}

#[cfg(test)]
mod test_likelihood {
    use super::*;
    use crate::arg_fixtures::two_tree_arg;
    use crate::Branch;
    use crate::NodeId;

    fn b(lower: usize, upper: usize) -> Branch {
        Branch::new(NodeId::new(lower), NodeId::new(upper))
    }

    fn assert_valid_times(arg: &Arg) {
        for r in arg.recombinations().values().filter(|r| !r.is_boundary()) {
            let (Some(p), Some(q)) = (r.deleted_node(), r.inserted_node()) else {
                panic!("event at {} has no derivable nodes", r.pos());
            };
            let upper = arg.nodes().time(p).min(arg.nodes().time(q));
            assert!(r.start_time() > 0.0, "at {}", r.pos());
            assert!(r.start_time() <= upper, "at {}", r.pos());
        }
    }

    #[test]
    fn test_data_likelihood() {
        let arg = two_tree_arg();
        let m: f64 = 0.01;
        // one mutation on (3, 4) of length 1 at 20 and one on
        // (2, 5) of length 1.5 at 70, over a total length of 575
        let expected = m.ln() + (1.5 * m).ln() - 575.0 * m;
        assert!((arg.data_likelihood(m) - expected).abs() < 1e-9);
    }

    #[test]
    fn test_smc_prior_likelihood() {
        let mut arg = two_tree_arg();
        arg.discretize(100.0);
        assert_eq!(arg.coordinates(), &[0.0, 50.0, 75.0, 100.0]);
        let r: f64 = 0.01;
        let first = -4.0 - 50.0 * r * 5.0;
        let second = -25.0 * r * 5.0 + (25.0 * r * 5.0_f64).ln() - 5.0_f64.ln() - 2.5;
        let third = -25.0 * r * 5.5 + (25.0 * r * 5.5_f64).ln() - 5.5_f64.ln() - 2.9;
        let expected = first + second + third;
        assert!((arg.smc_prior_likelihood(r) - expected).abs() < 1e-9);
        let total = arg.smc_likelihood(r, 0.01);
        assert!((total - expected - arg.data_likelihood(0.01)).abs() < 1e-9);
    }

    #[test]
    fn test_approx_sample_recombinations() {
        let mut arg = two_tree_arg();
        for r in arg.recombinations.values_mut().filter(|r| !r.is_boundary()) {
            let source = r.source_branch();
            r.set_source(source, 0.0);
        }
        arg.approx_sample_recombinations();
        assert_valid_times(&arg);
        arg.adjust_recombinations();
        assert_valid_times(&arg);
    }

    #[test]
    fn test_smc_sample_recombinations() {
        let mut arg = two_tree_arg();
        for seed in 0..20 {
            arg.rng = rand::SeedableRng::seed_from_u64(seed);
            arg.smc_sample_recombinations();
            assert_valid_times(&arg);
            let r = &arg.recombinations()[&Position::new(75.0)];
            assert!([b(1, 4), b(5, 4)].contains(&r.source_branch()));
        }
    }
}
