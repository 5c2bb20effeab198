//! Gradient boosted regression trees for a binary response (Bernoulli deviance).
//!
//! Follows Friedman's stochastic gradient boosting as implemented by R `gbm`:
//! - `F_0 = logit(mean y)` over the training rows
//! - each iteration fits a best-first regression tree with `interaction_depth` splits
//!   to the residuals `y - p` on a random subsample (`bag_fraction`) of training rows
//! - terminal nodes take one Newton step `sum(y - p) / sum(p (1 - p))`
//! - `F += shrinkage * tree(x)` for every row
//!
//! Rows are used in the order given: the first `floor(train_fraction * n)` rows train,
//! the remainder are held out for validation deviance.

use ps_core::{Error, Result};
use ps_prob::math::{bernoulli_deviance, logit, sigmoid};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

/// Boosting controls (names and defaults as in R `gbm`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GbmConfig {
    /// Number of boosting iterations.
    pub n_trees: usize,
    /// Splits per tree (1 = stumps, additive model).
    pub interaction_depth: usize,
    /// Learning rate.
    pub shrinkage: f64,
    /// Fraction of training rows drawn (without replacement) for each tree.
    pub bag_fraction: f64,
    /// Fraction of rows, taken from the top, used for training.
    pub train_fraction: f64,
    /// Minimum observations in a terminal node.
    pub min_obs_in_node: usize,
    /// RNG seed for bagging.
    pub seed: u64,
}

impl Default for GbmConfig {
    fn default() -> Self {
        Self {
            n_trees: 100,
            interaction_depth: 1,
            shrinkage: 0.1,
            bag_fraction: 0.5,
            train_fraction: 1.0,
            min_obs_in_node: 10,
            seed: 0,
        }
    }
}

impl GbmConfig {
    fn validate(&self) -> Result<()> {
        if self.n_trees == 0 {
            return Err(Error::Validation("n_trees must be >= 1".into()));
        }
        if self.interaction_depth == 0 {
            return Err(Error::Validation("interaction_depth must be >= 1".into()));
        }
        if !(self.shrinkage > 0.0 && self.shrinkage <= 1.0) {
            return Err(Error::Validation(format!(
                "shrinkage must be in (0, 1], got {}",
                self.shrinkage
            )));
        }
        if !(self.bag_fraction > 0.0 && self.bag_fraction <= 1.0) {
            return Err(Error::Validation(format!(
                "bag_fraction must be in (0, 1], got {}",
                self.bag_fraction
            )));
        }
        if !(self.train_fraction > 0.0 && self.train_fraction <= 1.0) {
            return Err(Error::Validation(format!(
                "train_fraction must be in (0, 1], got {}",
                self.train_fraction
            )));
        }
        if self.min_obs_in_node == 0 {
            return Err(Error::Validation("min_obs_in_node must be >= 1".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum Node {
    Leaf { value: f64 },
    Split { feature: usize, threshold: f64, left: usize, right: usize },
}

/// One regression tree. Rows with `x[feature] < threshold` go left.
#[derive(Debug, Clone)]
struct Tree {
    nodes: Vec<Node>,
}

impl Tree {
    fn predict(&self, row: &[f64]) -> f64 {
        let mut k = 0;
        loop {
            match &self.nodes[k] {
                Node::Leaf { value } => return *value,
                Node::Split { feature, threshold, left, right } => {
                    k = if row[*feature] < *threshold { *left } else { *right };
                }
            }
        }
    }
}

struct SplitCandidate {
    feature: usize,
    threshold: f64,
    improvement: f64,
}

/// Best squared-error split of `rows` over all features.
///
/// Improvement is `nL nR / (nL + nR) * (mean_L - mean_R)^2`.
fn best_split(x: &[Vec<f64>], z: &[f64], rows: &[usize], min_obs: usize) -> Option<SplitCandidate> {
    let n = rows.len();
    if n < 2 * min_obs {
        return None;
    }
    let p = x[rows[0]].len();
    let total: f64 = rows.iter().map(|&i| z[i]).sum();
    let mut best: Option<SplitCandidate> = None;
    let mut order = rows.to_vec();
    for j in 0..p {
        order.sort_by(|&a, &b| x[a][j].total_cmp(&x[b][j]).then(a.cmp(&b)));
        let mut left_sum = 0.0;
        for k in 0..n - 1 {
            left_sum += z[order[k]];
            let n_l = k + 1;
            let n_r = n - n_l;
            if n_l < min_obs {
                continue;
            }
            if n_r < min_obs {
                break;
            }
            let (a, b) = (x[order[k]][j], x[order[k + 1]][j]);
            if a >= b {
                continue;
            }
            let (nl, nr) = (n_l as f64, n_r as f64);
            let diff = left_sum / nl - (total - left_sum) / nr;
            let improvement = nl * nr / (nl + nr) * diff * diff;
            if best.as_ref().is_none_or(|s| improvement > s.improvement) {
                best = Some(SplitCandidate { feature: j, threshold: 0.5 * (a + b), improvement });
            }
        }
    }
    best.filter(|s| s.improvement > 0.0)
}

/// Grow one best-first tree on `bag`; adds split improvements to `influence`.
fn grow_tree(
    x: &[Vec<f64>],
    resid: &[f64],
    hess: &[f64],
    bag: &[usize],
    depth: usize,
    min_obs: usize,
    influence: &mut [f64],
) -> Tree {
    let mut nodes = vec![Node::Leaf { value: 0.0 }];
    let mut terminals: Vec<(usize, Vec<usize>, Option<SplitCandidate>)> =
        vec![(0, bag.to_vec(), best_split(x, resid, bag, min_obs))];

    for _ in 0..depth {
        let pick = terminals
            .iter()
            .enumerate()
            .filter_map(|(t, (_, _, s))| s.as_ref().map(|s| (t, s.improvement)))
            .fold(None, |acc: Option<(usize, f64)>, (t, imp)| match acc {
                Some((_, best)) if best >= imp => acc,
                _ => Some((t, imp)),
            });
        let Some((t, _)) = pick else { break };
        let (node, rows, split) = terminals.swap_remove(t);
        let Some(split) = split else { break };

        influence[split.feature] += split.improvement;
        let (left_rows, right_rows): (Vec<usize>, Vec<usize>) =
            rows.iter().partition(|&&i| x[i][split.feature] < split.threshold);
        let left = nodes.len();
        nodes.push(Node::Leaf { value: 0.0 });
        let right = nodes.len();
        nodes.push(Node::Leaf { value: 0.0 });
        nodes[node] =
            Node::Split { feature: split.feature, threshold: split.threshold, left, right };

        let ls = best_split(x, resid, &left_rows, min_obs);
        let rs = best_split(x, resid, &right_rows, min_obs);
        terminals.push((left, left_rows, ls));
        terminals.push((right, right_rows, rs));
    }

    for (node, rows, _) in terminals {
        let num: f64 = rows.iter().map(|&i| resid[i]).sum();
        let den: f64 = rows.iter().map(|&i| hess[i]).sum();
        let value = if den > 1e-300 { num / den } else { 0.0 };
        nodes[node] = Node::Leaf { value };
    }
    Tree { nodes }
}

/// A fitted boosting model.
#[derive(Debug, Clone, Serialize)]
pub struct GbmFit {
    /// Initial log-odds `F_0`.
    pub initial: f64,
    /// Learning rate used.
    pub shrinkage: f64,
    /// Mean Bernoulli deviance on the training rows after each iteration.
    pub train_deviance: Vec<f64>,
    /// Mean deviance on the held-out rows after each iteration.
    pub valid_deviance: Option<Vec<f64>>,
    /// Iteration (1-based) minimising validation deviance, or `n_trees` without validation rows.
    pub best_iteration: usize,
    /// Relative influence of each feature in percent (sums to 100 unless no split was made).
    pub relative_influence: Vec<f64>,
    /// The best validation iteration is the last one.
    pub may_need_more_trees: bool,
    /// Number of training rows.
    pub n_train: usize,
    #[serde(skip)]
    trees: Vec<Tree>,
}

/// Fit a Bernoulli boosting model of `treat` on `x_rows`.
pub fn fit_gbm(treat: &[u8], x_rows: &[Vec<f64>], config: &GbmConfig) -> Result<GbmFit> {
    config.validate()?;
    let n = treat.len();
    if n == 0 || x_rows.len() != n {
        return Err(Error::Validation(format!(
            "expected {} covariate rows, got {}",
            n,
            x_rows.len()
        )));
    }
    let p = x_rows[0].len();
    if p == 0 {
        return Err(Error::Validation("boosting needs at least one covariate".into()));
    }
    if x_rows.iter().any(|r| r.len() != p || r.iter().any(|v| !v.is_finite())) {
        return Err(Error::Validation("covariates must be rectangular and finite".into()));
    }
    if treat.iter().any(|&t| t > 1) {
        return Err(Error::Validation("treatment must be 0/1".into()));
    }

    let n_train = ((config.train_fraction * n as f64).floor() as usize).min(n);
    let n_bag = (config.bag_fraction * n_train as f64).floor() as usize;
    if n_bag < 2 * config.min_obs_in_node + 1 {
        return Err(Error::Validation(format!(
            "too few rows to grow a tree: {} bagged rows for min_obs_in_node = {}",
            n_bag, config.min_obs_in_node
        )));
    }
    let y: Vec<f64> = treat.iter().map(|&t| t as f64).collect();
    let mean = y[..n_train].iter().sum::<f64>() / n_train as f64;
    let initial = logit(mean).map_err(|_| {
        Error::Validation("training rows must contain both treated and control units".into())
    })?;

    let mut f = vec![initial; n];
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut train_idx: Vec<usize> = (0..n_train).collect();
    let mut influence = vec![0.0; p];
    let mut trees = Vec::with_capacity(config.n_trees);
    let mut train_deviance = Vec::with_capacity(config.n_trees);
    let mut valid_deviance = if n_train < n { Some(Vec::with_capacity(config.n_trees)) } else { None };
    let mut resid = vec![0.0; n];
    let mut hess = vec![0.0; n];

    for iter in 0..config.n_trees {
        for i in 0..n_train {
            let pi = sigmoid(f[i]);
            resid[i] = y[i] - pi;
            hess[i] = pi * (1.0 - pi);
        }
        train_idx.shuffle(&mut rng);
        let mut bag = train_idx[..n_bag].to_vec();
        bag.sort_unstable();

        let tree = grow_tree(
            x_rows,
            &resid,
            &hess,
            &bag,
            config.interaction_depth,
            config.min_obs_in_node,
            &mut influence,
        );
        for (fi, row) in f.iter_mut().zip(x_rows) {
            *fi += config.shrinkage * tree.predict(row);
        }
        trees.push(tree);

        let dev_t = mean_deviance(&y[..n_train], &f[..n_train]);
        if !dev_t.is_finite() {
            return Err(Error::Convergence(format!(
                "boosting deviance became non-finite at iteration {}",
                iter + 1
            )));
        }
        train_deviance.push(dev_t);
        if let Some(v) = valid_deviance.as_mut() {
            v.push(mean_deviance(&y[n_train..], &f[n_train..]));
        }
    }

    let best_iteration = match &valid_deviance {
        Some(v) => argmin(v) + 1,
        None => config.n_trees,
    };
    let may_need_more_trees = valid_deviance.is_some() && best_iteration == config.n_trees;
    if may_need_more_trees {
        log::warn!(
            "best validation iteration is the last of {} trees; boosting may need more trees",
            config.n_trees
        );
    }

    let total: f64 = influence.iter().sum();
    let relative_influence =
        if total > 0.0 { influence.iter().map(|v| 100.0 * v / total).collect() } else { influence };

    Ok(GbmFit {
        initial,
        shrinkage: config.shrinkage,
        train_deviance,
        valid_deviance,
        best_iteration,
        relative_influence,
        may_need_more_trees,
        n_train,
        trees,
    })
}

fn mean_deviance(y: &[f64], f: &[f64]) -> f64 {
    y.iter().zip(f).map(|(&yi, &fi)| bernoulli_deviance(yi, fi)).sum::<f64>() / y.len() as f64
}

fn argmin(v: &[f64]) -> usize {
    v.iter()
        .enumerate()
        .fold((0, f64::INFINITY), |(bi, bv), (i, &x)| if x < bv { (i, x) } else { (bi, bv) })
        .0
}

impl GbmFit {
    /// Number of fitted trees.
    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }

    fn check_iterations(&self, n_trees: usize) -> Result<()> {
        if n_trees == 0 || n_trees > self.trees.len() {
            return Err(Error::Validation(format!(
                "n_trees must be in 1..={}, got {}",
                self.trees.len(),
                n_trees
            )));
        }
        Ok(())
    }

    /// Log-odds using the first `n_trees` trees.
    pub fn predict_link(&self, x_rows: &[Vec<f64>], n_trees: usize) -> Result<Vec<f64>> {
        self.check_iterations(n_trees)?;
        Ok(x_rows
            .iter()
            .map(|row| {
                self.initial
                    + self.shrinkage * self.trees[..n_trees].iter().map(|t| t.predict(row)).sum::<f64>()
            })
            .collect())
    }

    /// Probabilities using the first `n_trees` trees.
    pub fn predict_proba(&self, x_rows: &[Vec<f64>], n_trees: usize) -> Result<Vec<f64>> {
        Ok(self.predict_link(x_rows, n_trees)?.into_iter().map(sigmoid).collect())
    }

    /// Probabilities at each of the (ascending) `iterations`, in one pass over the trees.
    pub fn staged_proba(&self, x_rows: &[Vec<f64>], iterations: &[usize]) -> Result<Vec<Vec<f64>>> {
        let mut out = Vec::with_capacity(iterations.len());
        let mut f = vec![self.initial; x_rows.len()];
        let mut done = 0;
        for &it in iterations {
            self.check_iterations(it)?;
            if it < done {
                return Err(Error::Validation("iterations must be ascending".into()));
            }
            for tree in &self.trees[done..it] {
                for (fi, row) in f.iter_mut().zip(x_rows) {
                    *fi += self.shrinkage * tree.predict(row);
                }
            }
            done = it;
            out.push(f.iter().map(|&v| sigmoid(v)).collect());
        }
        Ok(out)
    }
}
