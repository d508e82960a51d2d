mod meal;
mod meal_type;
mod mutation;

pub use meal::{Meal, MealItem, MealSnapshot, MealTotals};
pub use meal_type::MealType;
pub use mutation::{MutationRecord, MutationStatus, OperationType};
