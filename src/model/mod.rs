//! Canonical data model shared by every layer: observations, queries,
//! symbols, provider capability, corporate actions, and the three
//! data-quality result types (adjustment, drift, reconciliation).

pub mod adjustment;
pub mod corporate_action;
pub mod drift;
pub mod point;
pub mod provider;
pub mod query;
pub mod reconcile;
pub mod symbol;

pub use adjustment::{AdjustmentMode, AdjustmentResult, AdjustmentRow};
pub use corporate_action::{CorporateActionSet, DividendEvent, SplitEvent};
pub use drift::{DriftMetric, DriftResult, DriftStatus};
pub use point::DataPoint;
pub use provider::{AuthConfig, ProviderCapability, RateLimitConfig};
pub use query::{AssetKind, Market, Query, Timeframe};
pub use reconcile::{ReconcileStatus, ReconciliationResult, ReconciliationSample};
pub use symbol::{CanonicalSymbol, RuleTransform, SymbolRule};
