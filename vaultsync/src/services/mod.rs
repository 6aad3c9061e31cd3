//! Services module
//!
//! Business logic services that coordinate the write serializer, the
//! repositories and the derived indexes.

pub mod files;
pub mod history;
pub mod links;
pub mod notes;
pub mod scheduler;
pub mod settings;
pub mod vaults;

pub use files::{FileService, FileWrite};
pub use history::HistoryService;
pub use links::LinkParser;
pub use notes::{NoteService, NoteWrite, SaveOutcome, UpdateCheck};
pub use scheduler::MaintenanceScheduler;
pub use settings::SettingService;
pub use vaults::VaultService;
