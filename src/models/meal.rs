//! Meal and meal item records shared by the client and the server.
//!
//! These types define the JSON wire contract of the sync endpoints, so all
//! field names serialize as camelCase. `Meal.updated_at` is the conflict
//! token: the server advances it on every accepted write and a client must
//! present its last-seen value with each update or delete.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::MealType;

/// A logged meal as the server holds it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Meal {
    pub id: Uuid,
    pub user_id: String,
    /// When the meal was eaten. User-editable.
    pub timestamp: DateTime<Utc>,
    /// Server-assigned, advances monotonically on every accepted write.
    pub updated_at: DateTime<Utc>,
    pub meal_type: MealType,
    pub photo_id: Option<Uuid>,
    pub total_calories: f64,
    pub total_protein: f64,
    pub total_carbs: f64,
    pub total_fat: f64,
    pub items: Vec<MealItem>,
}

/// One food item within a meal.
///
/// Nutrition fields vary by food category, so the optional ones are explicit
/// fields rather than an open map; serialization round-trips are exact.
/// `volume_ml` and `caffeine_mg` are the beverage modifiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MealItem {
    pub name: String,
    pub portion: f64,
    pub portion_unit: String,
    pub calories: f64,
    pub protein_g: f64,
    pub carbs_g: f64,
    pub fat_g: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fiber_g: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sugar_g: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sodium_mg: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_ml: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caffeine_mg: Option<f64>,
}

/// Aggregated nutrition totals, recomputed from items on every write.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MealTotals {
    pub calories: f64,
    pub protein: f64,
    pub carbs: f64,
    pub fat: f64,
}

impl MealTotals {
    pub fn from_items(items: &[MealItem]) -> Self {
        let mut totals = MealTotals::default();
        for item in items {
            totals.calories += item.calories;
            totals.protein += item.protein_g;
            totals.carbs += item.carbs_g;
            totals.fat += item.fat_g;
        }
        totals
    }
}

/// The meal state captured in a queued mutation: everything needed to replay
/// the operation against the server.
///
/// `base_updated_at` is the conflict token the client last saw for the target
/// meal. It is `None` for creates and for updates queued behind a create that
/// the server has not yet acknowledged; the processor refreshes it from the
/// local view just before sending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MealSnapshot {
    pub timestamp: DateTime<Utc>,
    pub meal_type: MealType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo_id: Option<Uuid>,
    pub items: Vec<MealItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_updated_at: Option<DateTime<Utc>>,
}

impl MealItem {
    /// A plain food item with only the mandatory nutrition fields.
    pub fn basic(
        name: impl Into<String>,
        portion: f64,
        portion_unit: impl Into<String>,
        calories: f64,
        protein_g: f64,
        carbs_g: f64,
        fat_g: f64,
    ) -> Self {
        Self {
            name: name.into(),
            portion,
            portion_unit: portion_unit.into(),
            calories,
            protein_g,
            carbs_g,
            fat_g,
            fiber_g: None,
            sugar_g: None,
            sodium_mg: None,
            volume_ml: None,
            caffeine_mg: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_totals_from_items() {
        let items = vec![
            MealItem::basic("oatmeal", 150.0, "g", 180.0, 6.0, 32.0, 3.0),
            MealItem::basic("coffee", 240.0, "ml", 5.0, 0.5, 0.0, 0.0),
        ];
        let totals = MealTotals::from_items(&items);
        assert_eq!(totals.calories, 185.0);
        assert_eq!(totals.protein, 6.5);
        assert_eq!(totals.carbs, 32.0);
        assert_eq!(totals.fat, 3.0);
    }

    #[test]
    fn test_totals_empty() {
        assert_eq!(MealTotals::from_items(&[]), MealTotals::default());
    }

    #[test]
    fn test_meal_item_json_camel_case() {
        let mut item = MealItem::basic("latte", 1.0, "cup", 120.0, 6.0, 10.0, 5.0);
        item.caffeine_mg = Some(75.0);

        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["portionUnit"], "cup");
        assert_eq!(json["proteinG"], 6.0);
        assert_eq!(json["caffeineMg"], 75.0);
        // Unset optional fields are omitted entirely.
        assert!(json.get("fiberG").is_none());

        let parsed: MealItem = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, item);
    }

    #[test]
    fn test_snapshot_json_roundtrip() {
        let snapshot = MealSnapshot {
            timestamp: Utc::now(),
            meal_type: MealType::Lunch,
            photo_id: Some(Uuid::new_v4()),
            items: vec![MealItem::basic("soup", 300.0, "ml", 150.0, 4.0, 12.0, 8.0)],
            base_updated_at: None,
        };
        let json = serde_json::to_string(&snapshot).unwrap();
        let parsed: MealSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, snapshot);
    }
}
