//! Search pipeline stages: classify, analyze, generate, execute, validate, refine.

pub mod analyzer;
pub mod intent;
pub mod merge;
pub mod query_generator;
pub mod refiner;
pub mod validator;

pub use analyzer::{AnalysisResult, SearchAnalyzer};
pub use intent::{ClassificationResult, ClassificationSource, IntentClassifier};
pub use merge::{execute_query_set, merge_results, SearchRun};
pub use query_generator::{QueryGenerator, QuerySet, QueryStrategy};
pub use refiner::{RefinementPlan, RefinementStrategy, SearchRefiner};
pub use validator::{QualityClass, ResultValidator, ValidationResult};
