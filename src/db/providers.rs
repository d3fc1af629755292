//! Provider registry.

use super::{json_column, now_ms, Database};
use crate::types::Provider;
use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
pub struct NewProvider {
    pub name: String,
    pub wallet_address: String,
    pub capability_ids: Vec<String>,
    pub price: f64,
    pub eta_minutes: i64,
    pub rating: f64,
    pub success_rate: f64,
    pub stake_amount: f64,
}

fn parse_provider_row(row: &Row) -> rusqlite::Result<Provider> {
    Ok(Provider {
        id: row.get("id")?,
        name: row.get("name")?,
        wallet_address: row.get("wallet_address")?,
        capability_ids: json_column(row.get("capability_ids")?)?.unwrap_or_default(),
        price: row.get("price")?,
        eta_minutes: row.get("eta_minutes")?,
        rating: row.get("rating")?,
        success_rate: row.get("success_rate")?,
        stake_amount: row.get("stake_amount")?,
        created_at: row.get("created_at")?,
    })
}

fn get_provider_internal(conn: &Connection, provider_id: &str) -> Result<Option<Provider>> {
    let provider = conn
        .query_row(
            "SELECT * FROM providers WHERE id = ?1",
            params![provider_id],
            parse_provider_row,
        )
        .optional()?;
    Ok(provider)
}

impl Database {
    pub fn insert_provider(&self, new: &NewProvider) -> Result<Provider> {
        let id = Uuid::now_v7().to_string();
        let now = now_ms();

        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO providers (id, name, wallet_address, capability_ids, price,
                    eta_minutes, rating, success_rate, stake_amount, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    id,
                    new.name,
                    new.wallet_address,
                    serde_json::to_string(&new.capability_ids)?,
                    new.price,
                    new.eta_minutes,
                    new.rating,
                    new.success_rate,
                    new.stake_amount,
                    now,
                ],
            )?;

            get_provider_internal(conn, &id)?
                .ok_or_else(|| anyhow!("Provider {} vanished after insert", id))
        })
    }

    pub fn get_provider(&self, provider_id: &str) -> Result<Option<Provider>> {
        self.with_conn(|conn| get_provider_internal(conn, provider_id))
    }

    /// Providers ordered by rating, optionally limited to one capability.
    pub fn list_providers(&self, capability: Option<&str>) -> Result<Vec<Provider>> {
        self.with_conn(|conn| {
            let providers = match capability {
                Some(capability) => {
                    let mut stmt = conn.prepare(
                        "SELECT * FROM providers
                         WHERE EXISTS (SELECT 1 FROM json_each(providers.capability_ids)
                                       WHERE json_each.value = ?1)
                         ORDER BY rating DESC, created_at",
                    )?;
                    stmt.query_map(params![capability], parse_provider_row)?
                        .collect::<rusqlite::Result<Vec<_>>>()?
                }
                None => {
                    let mut stmt =
                        conn.prepare("SELECT * FROM providers ORDER BY rating DESC, created_at")?;
                    stmt.query_map([], parse_provider_row)?
                        .collect::<rusqlite::Result<Vec<_>>>()?
                }
            };
            Ok(providers)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_filter_and_rating_order() {
        let db = Database::open_in_memory().unwrap();
        db.insert_provider(&NewProvider {
            name: "Low".to_string(),
            wallet_address: "0x01".to_string(),
            capability_ids: vec!["booking".to_string()],
            rating: 3.0,
            ..Default::default()
        })
        .unwrap();
        db.insert_provider(&NewProvider {
            name: "High".to_string(),
            wallet_address: "0x02".to_string(),
            capability_ids: vec!["booking".to_string(), "delivery".to_string()],
            rating: 4.8,
            ..Default::default()
        })
        .unwrap();

        let booking = db.list_providers(Some("booking")).unwrap();
        assert_eq!(
            booking.iter().map(|p| p.name.as_str()).collect::<Vec<_>>(),
            vec!["High", "Low"]
        );
        assert_eq!(db.list_providers(Some("delivery")).unwrap().len(), 1);
        assert!(db.list_providers(Some("cleaning")).unwrap().is_empty());
    }
}
