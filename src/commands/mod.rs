mod meal;
mod sync_cmd;

pub use meal::MealCommand;
pub use sync_cmd::{SyncCommand, SyncContext};
