use std::cmp::Reverse;
use std::time::Instant;

use crate::backlinks::{self, extract_references};
use crate::database::{self, Database};
use crate::errors::{ApiError, ApiResult};
use crate::models::*;
use crate::{log_service_start, log_service_success};

/// Width numeric runs are padded to when ordering card identifiers.
const SORT_PAD_WIDTH: usize = 10;

#[derive(Clone)]
pub struct CardService {
    db: Database,
}

impl CardService {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// True when no live card other than `exclude` uses `card_id`.
    /// The empty identifier is never considered taken.
    pub async fn is_unique(&self, card_id: &str, exclude: Option<i64>) -> ApiResult<bool> {
        if card_id.is_empty() {
            return Ok(true);
        }
        let mut conn = self.db.pool.acquire().await?;
        Ok(!database::card_id_in_use(&mut conn, card_id, exclude).await?)
    }

    pub async fn create_card(&self, user_id: i64, request: CreateCardRequest) -> ApiResult<FullCard> {
        log_service_start!("card_service", "create_card", card_id = request.card_id);
        let started = Instant::now();

        if !self.is_unique(&request.card_id, None).await? {
            return Err(duplicate_id());
        }

        let mut tx = self.db.pool.begin().await?;
        // A concurrent insert that slipped past the check trips the unique index here
        let id = database::insert_card(&mut tx, user_id, &request).await?;
        if !request.card_id.is_empty() {
            backlinks::synchronize(&mut tx, &request.card_id, &extract_references(&request.body))
                .await?;
        }
        tx.commit().await?;

        log_service_success!(
            "card_service",
            "create_card",
            card_id = request.card_id,
            duration_ms = started.elapsed().as_millis() as u64
        );
        let card = self.require_card(id).await?;
        self.assemble(card).await
    }

    /// Full card for `id`; records a view by `viewer`.
    pub async fn get_full_card(&self, id: i64, viewer: i64) -> ApiResult<FullCard> {
        let card = self.require_card(id).await?;
        self.db.log_card_view(id, viewer).await?;
        self.assemble(card).await
    }

    pub async fn update_card(&self, id: i64, request: UpdateCardRequest) -> ApiResult<FullCard> {
        log_service_start!("card_service", "update_card", card_id = request.card_id);
        let started = Instant::now();

        let mut tx = self.db.pool.begin().await?;
        let existing = database::fetch_card(&mut tx, id)
            .await?
            .ok_or_else(card_not_found)?;

        if !request.card_id.is_empty()
            && database::card_id_in_use(&mut tx, &request.card_id, Some(id)).await?
        {
            return Err(duplicate_id());
        }

        database::update_card_row(&mut tx, id, &request).await?;

        // The old identifier no longer names this card, so its outgoing links go with it
        if existing.card_id != request.card_id && !existing.card_id.is_empty() {
            backlinks::remove_source(&mut tx, &existing.card_id).await?;
        }
        if !request.card_id.is_empty() {
            backlinks::synchronize(&mut tx, &request.card_id, &extract_references(&request.body))
                .await?;
        }
        tx.commit().await?;

        log_service_success!(
            "card_service",
            "update_card",
            card_id = request.card_id,
            duration_ms = started.elapsed().as_millis() as u64
        );
        let card = self.require_card(id).await?;
        self.assemble(card).await
    }

    /// Soft-delete the card and drop the backlinks it originates.
    pub async fn delete_card(&self, id: i64) -> ApiResult<()> {
        let mut tx = self.db.pool.begin().await?;
        let existing = database::fetch_card(&mut tx, id)
            .await?
            .ok_or_else(card_not_found)?;

        database::soft_delete_card(&mut tx, id).await?;
        if !existing.card_id.is_empty() {
            backlinks::remove_source(&mut tx, &existing.card_id).await?;
        }
        tx.commit().await?;

        log_service_success!(
            "card_service",
            "delete_card",
            format!("card {} ({}) deleted", id, existing.card_id)
        );
        Ok(())
    }

    /// Live cards matching `search_term`, ordered by identifier descending.
    pub async fn list_cards(&self, search_term: Option<&str>, partial: bool) -> ApiResult<CardListing> {
        if partial {
            let mut cards = self.db.search_partial_cards(search_term).await?;
            cards.sort_by_cached_key(|c| Reverse(sort_key(&c.card_id)));
            Ok(CardListing::Partial(cards))
        } else {
            let mut cards = self.db.search_cards(search_term).await?;
            cards.sort_by_cached_key(|c| Reverse(sort_key(&c.card_id)));
            Ok(CardListing::Full(cards))
        }
    }

    async fn require_card(&self, id: i64) -> ApiResult<Card> {
        self.db.get_card(id).await?.ok_or_else(card_not_found)
    }

    async fn assemble(&self, card: Card) -> ApiResult<FullCard> {
        let references = if card.card_id.is_empty() {
            Vec::new()
        } else {
            self.db.get_referencing_cards(&card.card_id).await?
        };
        let files = self.db.list_files_for_card(card.id).await?;
        Ok(FullCard {
            card,
            references,
            files,
        })
    }
}

fn duplicate_id() -> ApiError {
    ApiError::DuplicateResource("id already used".to_string())
}

fn card_not_found() -> ApiError {
    ApiError::NotFound("Card not found".to_string())
}

/// Ordering key for a card identifier.
///
/// The identifier is split into alternating digit and non-digit runs, digits
/// first (so the first run may be empty). Digit runs are zero-padded so that
/// `c10` sorts after `c2`.
pub fn sort_key(card_id: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_digits = true;

    for ch in card_id.chars() {
        let is_digit = ch.is_ascii_digit();
        if is_digit != in_digits {
            parts.push(finish_run(std::mem::take(&mut current), in_digits));
            in_digits = is_digit;
        }
        current.push(ch);
    }
    parts.push(finish_run(current, in_digits));
    if !in_digits {
        parts.push(String::new());
    }
    parts
}

fn finish_run(run: String, numeric: bool) -> String {
    if numeric && !run.is_empty() {
        format!("{:0>width$}", run, width = SORT_PAD_WIDTH)
    } else {
        run
    }
}
