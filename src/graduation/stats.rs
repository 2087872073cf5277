use crate::models::{profit_factor, PseudoPositionTrial};

/// Win/loss statistics over a window of closed trials
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TrialStats {
    pub count: usize,
    pub wins: usize,
    pub losses: usize,
    pub win_rate: f64,
    pub avg_profit: f64,
    pub avg_loss: f64,
    /// Mean hours losing trials stayed open
    pub avg_drawdown_hours: f64,
}

impl TrialStats {
    pub fn from_trials(trials: &[PseudoPositionTrial]) -> Self {
        let closed: Vec<&PseudoPositionTrial> =
            trials.iter().filter(|t| t.realized_pnl.is_some()).collect();
        if closed.is_empty() {
            return Self::default();
        }

        let mut gains = 0.0;
        let mut losses_sum = 0.0;
        let mut loss_hours = 0.0;
        let mut wins = 0;
        let mut losses = 0;
        for trial in &closed {
            let pnl = trial.realized_pnl.unwrap_or(0.0);
            if pnl > 0.0 {
                wins += 1;
                gains += pnl;
            } else {
                losses += 1;
                losses_sum += pnl.abs();
                loss_hours += trial.open_hours().unwrap_or(0.0);
            }
        }

        let mean = |sum: f64, n: usize| if n == 0 { 0.0 } else { sum / n as f64 };
        Self {
            count: closed.len(),
            wins,
            losses,
            win_rate: wins as f64 / closed.len() as f64,
            avg_profit: mean(gains, wins),
            avg_loss: mean(losses_sum, losses),
            avg_drawdown_hours: mean(loss_hours, losses),
        }
    }

    pub fn profit_factor(&self) -> f64 {
        profit_factor(self.avg_profit, self.avg_loss, self.win_rate)
    }
}
