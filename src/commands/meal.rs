use chrono::{DateTime, Utc};
use clap::{Args, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use platelog::db::LocalMealRepository;
use platelog::models::{Meal, MealItem, MealSnapshot, MealType};
use platelog::sync::{MealSyncClient, NewPhoto};

#[derive(Clone, ValueEnum, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Args)]
pub struct MealCommand {
    #[command(subcommand)]
    pub command: MealSubcommand,
}

#[derive(Subcommand)]
pub enum MealSubcommand {
    /// Log a new meal
    Log {
        /// Meal item as "name=oats,portion=50,unit=g,calories=190" (can be repeated)
        #[arg(long = "item", value_name = "ITEM", required = true)]
        items: Vec<String>,

        /// Meal type (breakfast, lunch, dinner, snack)
        #[arg(long = "type", short = 't', value_name = "TYPE")]
        meal_type: Option<String>,

        /// When the meal was eaten (RFC 3339), defaults to now
        #[arg(long)]
        time: Option<String>,

        /// Attach a photo from a file
        #[arg(long)]
        photo: Option<PathBuf>,
    },

    /// Update an existing meal (replaces its items)
    Update {
        /// Meal ID (UUID)
        meal_id: String,

        /// Meal item as "name=oats,portion=50,unit=g,calories=190" (can be repeated)
        #[arg(long = "item", value_name = "ITEM", required = true)]
        items: Vec<String>,

        /// Meal type (breakfast, lunch, dinner, snack)
        #[arg(long = "type", short = 't', value_name = "TYPE")]
        meal_type: Option<String>,

        /// When the meal was eaten (RFC 3339)
        #[arg(long)]
        time: Option<String>,

        /// Attach a photo from a file
        #[arg(long)]
        photo: Option<PathBuf>,
    },

    /// Delete a meal
    Delete {
        /// Meal ID (UUID)
        meal_id: String,
    },

    /// List logged meals
    List {
        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Show one meal in detail
    Show {
        /// Meal ID (UUID)
        meal_id: String,
    },
}

impl MealCommand {
    pub async fn run(
        &self,
        client: &MealSyncClient,
        local: &LocalMealRepository,
    ) -> Result<(), Box<dyn std::error::Error>> {
        match &self.command {
            MealSubcommand::Log {
                items,
                meal_type,
                time,
                photo,
            } => {
                let snapshot = build_snapshot(items, meal_type, time, local, None).await?;
                let photo = photo.as_deref().map(read_photo).transpose()?;

                let meal_id = client.create_meal(snapshot, photo).await?;

                println!("Logged meal:");
                println!();
                if let Some(meal) = local.get(meal_id).await? {
                    print_meal_details(&meal);
                }
                print_queue_hint(client).await?;
                Ok(())
            }
            MealSubcommand::Update {
                meal_id,
                items,
                meal_type,
                time,
                photo,
            } => {
                let meal_id = parse_meal_id(meal_id)?;
                let existing = local
                    .get(meal_id)
                    .await?
                    .ok_or_else(|| format!("Meal not found: {}", meal_id))?;

                let snapshot =
                    build_snapshot(items, meal_type, time, local, Some(&existing)).await?;
                let photo = photo.as_deref().map(read_photo).transpose()?;

                client.update_meal(meal_id, snapshot, photo).await?;

                println!("Updated meal:");
                println!();
                if let Some(meal) = local.get(meal_id).await? {
                    print_meal_details(&meal);
                }
                print_queue_hint(client).await?;
                Ok(())
            }
            MealSubcommand::Delete { meal_id } => {
                let meal_id = parse_meal_id(meal_id)?;
                client.delete_meal(meal_id).await?;

                println!("Deleted meal {}", meal_id);
                print_queue_hint(client).await?;
                Ok(())
            }
            MealSubcommand::List { format } => {
                let meals = local.list().await?;
                if meals.is_empty() {
                    println!("No meals logged.");
                    return Ok(());
                }

                match format {
                    OutputFormat::Json => {
                        println!("{}", serde_json::to_string_pretty(&meals)?);
                    }
                    OutputFormat::Text => {
                        for meal in &meals {
                            let names: Vec<&str> =
                                meal.items.iter().map(|i| i.name.as_str()).collect();
                            println!(
                                "  {}  {:10} {:7.0} kcal  {}",
                                meal.timestamp.format("%Y-%m-%d %H:%M"),
                                meal.meal_type,
                                meal.total_calories,
                                names.join(", ")
                            );
                            println!("    ID: {}", meal.id);
                        }
                        println!("\nTotal: {} meal(s)", meals.len());
                    }
                }
                Ok(())
            }
            MealSubcommand::Show { meal_id } => {
                let meal_id = parse_meal_id(meal_id)?;
                let meal = local
                    .get(meal_id)
                    .await?
                    .ok_or_else(|| format!("Meal not found: {}", meal_id))?;
                print_meal_details(&meal);
                Ok(())
            }
        }
    }
}

fn parse_meal_id(s: &str) -> Result<Uuid, String> {
    Uuid::parse_str(s).map_err(|_| format!("Invalid meal UUID: {}", s))
}

async fn build_snapshot(
    items: &[String],
    meal_type: &Option<String>,
    time: &Option<String>,
    local: &LocalMealRepository,
    existing: Option<&Meal>,
) -> Result<MealSnapshot, Box<dyn std::error::Error>> {
    let parsed_items = items
        .iter()
        .map(|s| parse_item(s))
        .collect::<Result<Vec<_>, _>>()?;

    let meal_type = match meal_type {
        Some(s) => s.parse::<MealType>()?,
        None => existing.map(|m| m.meal_type).unwrap_or_default(),
    };

    let timestamp = match time {
        Some(s) => DateTime::parse_from_rfc3339(s)
            .map_err(|_| format!("Invalid time '{}'. Use RFC 3339, e.g. 2026-08-01T12:30:00Z", s))?
            .with_timezone(&Utc),
        None => existing.map(|m| m.timestamp).unwrap_or_else(Utc::now),
    };

    let base_updated_at = match existing {
        Some(meal) => local.conflict_token(meal.id).await?,
        None => None,
    };

    Ok(MealSnapshot {
        timestamp,
        meal_type,
        photo_id: existing.and_then(|m| m.photo_id),
        items: parsed_items,
        base_updated_at,
    })
}

/// Parses one `--item` value: comma-separated key=value pairs.
///
/// Required: name, portion, unit, calories. Optional: protein, carbs, fat,
/// fiber, sugar, sodium, volume, caffeine.
fn parse_item(s: &str) -> Result<MealItem, String> {
    let mut name: Option<String> = None;
    let mut portion: Option<f64> = None;
    let mut unit: Option<String> = None;
    let mut calories: Option<f64> = None;
    let mut protein = 0.0;
    let mut carbs = 0.0;
    let mut fat = 0.0;
    let mut fiber = None;
    let mut sugar = None;
    let mut sodium = None;
    let mut volume = None;
    let mut caffeine = None;

    for pair in s.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| format!("Invalid item field '{}'. Use key=value.", pair))?;
        let parse_num = || -> Result<f64, String> {
            value
                .parse::<f64>()
                .map_err(|_| format!("Invalid number for '{}': {}", key, value))
        };

        match key.trim() {
            "name" => name = Some(value.to_string()),
            "portion" => portion = Some(parse_num()?),
            "unit" => unit = Some(value.to_string()),
            "calories" => calories = Some(parse_num()?),
            "protein" => protein = parse_num()?,
            "carbs" => carbs = parse_num()?,
            "fat" => fat = parse_num()?,
            "fiber" => fiber = Some(parse_num()?),
            "sugar" => sugar = Some(parse_num()?),
            "sodium" => sodium = Some(parse_num()?),
            "volume" => volume = Some(parse_num()?),
            "caffeine" => caffeine = Some(parse_num()?),
            other => return Err(format!("Unknown item field: {}", other)),
        }
    }

    let name = name.ok_or("Item is missing 'name'")?;
    let portion = portion.ok_or("Item is missing 'portion'")?;
    let unit = unit.ok_or("Item is missing 'unit'")?;
    let calories = calories.ok_or("Item is missing 'calories'")?;

    let mut item = MealItem::basic(&name, portion, &unit, calories, protein, carbs, fat);
    item.fiber_g = fiber;
    item.sugar_g = sugar;
    item.sodium_mg = sodium;
    item.volume_ml = volume;
    item.caffeine_mg = caffeine;
    Ok(item)
}

fn read_photo(path: &Path) -> Result<NewPhoto, Box<dyn std::error::Error>> {
    let bytes = std::fs::read(path)
        .map_err(|e| format!("Failed to read photo '{}': {}", path.display(), e))?;
    let mime_type = match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .as_deref()
    {
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        Some("heic") => "image/heic",
        _ => "image/jpeg",
    };
    Ok(NewPhoto {
        bytes,
        mime_type: mime_type.to_string(),
    })
}

fn print_meal_details(meal: &Meal) {
    println!("  Time: {}", meal.timestamp.format("%Y-%m-%d %H:%M"));
    println!("  Type: {}", meal.meal_type);
    if let Some(photo_id) = meal.photo_id {
        println!("  Photo: {}", photo_id);
    }
    println!("  Items:");
    for item in &meal.items {
        println!(
            "    - {} ({} {}): {:.0} kcal, {:.1}g protein, {:.1}g carbs, {:.1}g fat",
            item.name, item.portion, item.portion_unit, item.calories, item.protein_g,
            item.carbs_g, item.fat_g
        );
    }
    println!(
        "  Totals: {:.0} kcal, {:.1}g protein, {:.1}g carbs, {:.1}g fat",
        meal.total_calories, meal.total_protein, meal.total_carbs, meal.total_fat
    );
    println!();
    println!("Meal ID: {}", meal.id);
}

async fn print_queue_hint(client: &MealSyncClient) -> Result<(), Box<dyn std::error::Error>> {
    let pending = client.pending_count().await?;
    if pending > 0 {
        println!("({} change(s) waiting to sync)", pending);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_item_full() {
        let item = parse_item(
            "name=oats,portion=50,unit=g,calories=190,protein=7,carbs=34,fat=3,fiber=5",
        )
        .unwrap();
        assert_eq!(item.name, "oats");
        assert_eq!(item.portion, 50.0);
        assert_eq!(item.portion_unit, "g");
        assert_eq!(item.calories, 190.0);
        assert_eq!(item.protein_g, 7.0);
        assert_eq!(item.fiber_g, Some(5.0));
        assert_eq!(item.sugar_g, None);
    }

    #[test]
    fn test_parse_item_macros_default_to_zero() {
        let item = parse_item("name=tea,portion=1,unit=cup,calories=2").unwrap();
        assert_eq!(item.protein_g, 0.0);
        assert_eq!(item.carbs_g, 0.0);
        assert_eq!(item.fat_g, 0.0);
    }

    #[test]
    fn test_parse_item_missing_required_field() {
        let err = parse_item("name=oats,portion=50,unit=g").unwrap_err();
        assert!(err.contains("calories"));
    }

    #[test]
    fn test_parse_item_rejects_unknown_field() {
        let err = parse_item("name=oats,portion=50,unit=g,calories=190,color=brown").unwrap_err();
        assert!(err.contains("color"));
    }

    #[test]
    fn test_parse_item_rejects_bad_number() {
        let err = parse_item("name=oats,portion=lots,unit=g,calories=190").unwrap_err();
        assert!(err.contains("portion"));
    }
}
