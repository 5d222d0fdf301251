//! Matrix-level LP boundary.
//!
//! The planner formulates its problem as plain vectors and sparse rows; a
//! backend turns that into a solver-specific model. Swapping the LP library
//! touches only this file.

use minilp::{ComparisonOp, OptimizationDirection, Problem};

/// One sparse constraint row: sum(coeffs) (=|<=) rhs
#[derive(Debug, Clone)]
pub struct SparseRow {
    pub coeffs: Vec<(usize, f64)>,
    pub rhs: f64,
}

/// A minimisation LP over `objective.len()` variables.
#[derive(Debug, Clone, Default)]
pub struct LpProblem {
    pub objective: Vec<f64>,
    /// Per-variable (lower, upper) bounds
    pub bounds: Vec<(f64, f64)>,
    pub eq_rows: Vec<SparseRow>,
    pub ub_rows: Vec<SparseRow>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LpStatus {
    Optimal,
    Infeasible,
    Unbounded,
}

#[derive(Debug, Clone)]
pub struct LpSolution {
    pub status: LpStatus,
    /// Variable values; empty unless status is Optimal
    pub x: Vec<f64>,
    pub objective: f64,
}

pub trait LpSolver: Send + Sync {
    fn solve(&self, problem: &LpProblem) -> LpSolution;
}

/// Pure-Rust simplex backend.
#[derive(Debug, Default, Clone, Copy)]
pub struct MinilpSolver;

impl LpSolver for MinilpSolver {
    fn solve(&self, lp: &LpProblem) -> LpSolution {
        let mut problem = Problem::new(OptimizationDirection::Minimize);

        let vars: Vec<minilp::Variable> = lp
            .objective
            .iter()
            .zip(&lp.bounds)
            .map(|(coeff, (lo, hi))| problem.add_var(*coeff, (*lo, *hi)))
            .collect();

        for row in &lp.eq_rows {
            let expr: Vec<(minilp::Variable, f64)> =
                row.coeffs.iter().map(|(i, c)| (vars[*i], *c)).collect();
            problem.add_constraint(expr.as_slice(), ComparisonOp::Eq, row.rhs);
        }
        for row in &lp.ub_rows {
            let expr: Vec<(minilp::Variable, f64)> =
                row.coeffs.iter().map(|(i, c)| (vars[*i], *c)).collect();
            problem.add_constraint(expr.as_slice(), ComparisonOp::Le, row.rhs);
        }

        match problem.solve() {
            Ok(solution) => LpSolution {
                status: LpStatus::Optimal,
                x: vars.iter().map(|v| solution[*v]).collect(),
                objective: solution.objective(),
            },
            Err(minilp::Error::Infeasible) => {
                LpSolution { status: LpStatus::Infeasible, x: Vec::new(), objective: 0.0 }
            }
            Err(minilp::Error::Unbounded) => {
                LpSolution { status: LpStatus::Unbounded, x: Vec::new(), objective: 0.0 }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn solves_trivial_two_variable_problem() {
        // min x + 2y  s.t. x + y = 10, x <= 4, x,y >= 0
        let lp = LpProblem {
            objective: vec![1.0, 2.0],
            bounds: vec![(0.0, 4.0), (0.0, f64::INFINITY)],
            eq_rows: vec![SparseRow { coeffs: vec![(0, 1.0), (1, 1.0)], rhs: 10.0 }],
            ub_rows: vec![],
        };
        let solution = MinilpSolver.solve(&lp);
        assert_eq!(solution.status, LpStatus::Optimal);
        assert!((solution.x[0] - 4.0).abs() < 1e-6);
        assert!((solution.x[1] - 6.0).abs() < 1e-6);
        assert!((solution.objective - 16.0).abs() < 1e-6);
    }

    #[test]
    fn reports_infeasible() {
        // x <= 1 and x = 5 cannot both hold
        let lp = LpProblem {
            objective: vec![1.0],
            bounds: vec![(0.0, 1.0)],
            eq_rows: vec![SparseRow { coeffs: vec![(0, 1.0)], rhs: 5.0 }],
            ub_rows: vec![],
        };
        assert_eq!(MinilpSolver.solve(&lp).status, LpStatus::Infeasible);
    }

    #[test]
    fn inequality_rows_bind() {
        // min -x  s.t. x + y <= 3, y >= 1
        let lp = LpProblem {
            objective: vec![-1.0, 0.0],
            bounds: vec![(0.0, f64::INFINITY), (1.0, f64::INFINITY)],
            eq_rows: vec![],
            ub_rows: vec![SparseRow { coeffs: vec![(0, 1.0), (1, 1.0)], rhs: 3.0 }],
        };
        let solution = MinilpSolver.solve(&lp);
        assert_eq!(solution.status, LpStatus::Optimal);
        assert!((solution.x[0] - 2.0).abs() < 1e-6);
    }
}
