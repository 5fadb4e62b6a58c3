// =============================================================================
// Signals Module
// =============================================================================
//
// Reversal-signal processing for exit decisions:
// - Multi-indicator confluence scoring and urgency classification

pub mod confluence;

pub use confluence::{
    ConfluenceConfig, ConfluenceReport, ConfluenceScorer, ConfluenceSignal, ExitClass, Indicator, SignalDirection,
};
