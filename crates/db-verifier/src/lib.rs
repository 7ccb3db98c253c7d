//! C5 Database Verifier — direct read/write to the shared job database,
//! used to verify ownership and force-complete jobs when the Gateway
//! misbehaves (spec.md §4.2).
//!
//! Every operation is present only when the verifier is enabled by
//! configuration (spec.md §4.2): disabled or disconnected, every method
//! fails with [`DbError::NotEnabled`].

use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use mongodb::bson::{self, doc, Bson, Document};
use mongodb::{Client, Collection};
use serde::{Deserialize, Serialize};

use threespeak_core::{canonicalize_did, compare_dids};

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("database verifier is not enabled")]
    NotEnabled,
    #[error("database connection lost")]
    ConnectionLost,
    #[error("mongo error: {0}")]
    Mongo(#[from] mongodb::error::Error),
    #[error("bson deserialize error: {0}")]
    Bson(#[from] bson::de::Error),
}

/// Wire shape of the fields this worker reads/writes on the `jobs`
/// collection (spec.md §6 "Database schema"). Fields outside this set
/// are left untouched by round-tripping through `UpdateJob`'s arbitrary
/// patch rather than a full document replace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDocument {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub status: String,
    #[serde(default)]
    pub assigned_to: Option<String>,
    #[serde(default)]
    pub assigned_date: Option<chrono::DateTime<Utc>>,
    #[serde(default)]
    pub last_pinged: Option<chrono::DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<chrono::DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct OwnershipVerification {
    pub exists: bool,
    pub is_owned: bool,
    pub actual_owner: Option<String>,
    pub status: Option<String>,
    pub raw: Option<serde_json::Value>,
}

pub struct DbVerifier {
    collection: Collection<Document>,
    client: Client,
    connected: AtomicBool,
}

impl DbVerifier {
    pub async fn connect(uri: &str, db_name: &str, collection_name: &str) -> Result<Self, DbError> {
        let client = Client::with_uri_str(uri).await?;
        client
            .database("admin")
            .run_command(doc! {"ping": 1})
            .await?;
        let collection = client.database(db_name).collection(collection_name);
        Ok(Self {
            collection,
            client,
            connected: AtomicBool::new(true),
        })
    }

    fn check_connected(&self) -> Result<(), DbError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(DbError::ConnectionLost);
        }
        Ok(())
    }

    fn note_failure(&self, err: mongodb::error::Error) -> DbError {
        self.connected.store(false, Ordering::SeqCst);
        DbError::Mongo(err)
    }

    /// Re-pings the deployment; on success flips `connected` back to true
    /// so the caller may retry its operation.
    pub async fn reconnect(&self) -> Result<(), DbError> {
        self.client
            .database("admin")
            .run_command(doc! {"ping": 1})
            .await?;
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub async fn verify_ownership(
        &self,
        id: &str,
        our_did: &str,
    ) -> Result<OwnershipVerification, DbError> {
        self.check_connected()?;
        let found = self
            .collection
            .find_one(doc! {"_id": id})
            .await
            .map_err(|e| self.note_failure(e))?;

        let Some(raw_doc) = found else {
            return Ok(OwnershipVerification {
                exists: false,
                ..Default::default()
            });
        };

        let assigned_to = raw_doc.get_str("assigned_to").ok().map(str::to_string);
        let status = raw_doc.get_str("status").ok().map(str::to_string);

        let is_owned = match &assigned_to {
            Some(owner) => {
                let cmp = compare_dids(owner, our_did);
                if cmp.core_only {
                    // Format mismatch only, not a real ownership mismatch (spec.md §4.2).
                    log_format_inconsistency(owner, our_did);
                }
                cmp.equal
            }
            None => false,
        };

        let raw_json = Bson::Document(raw_doc).into_relaxed_extjson();

        Ok(OwnershipVerification {
            exists: true,
            is_owned,
            actual_owner: assigned_to,
            status,
            raw: Some(raw_json),
        })
    }

    pub async fn get_job_details(&self, id: &str) -> Result<Option<JobDocument>, DbError> {
        self.check_connected()?;
        let found = self
            .collection
            .find_one(doc! {"_id": id})
            .await
            .map_err(|e| self.note_failure(e))?;
        match found {
            None => Ok(None),
            Some(doc) => Ok(Some(bson::from_document(doc)?)),
        }
    }

    pub async fn update_job(&self, id: &str, patch: Document) -> Result<(), DbError> {
        self.check_connected()?;
        self.collection
            .update_one(doc! {"_id": id}, doc! {"$set": patch})
            .await
            .map_err(|e| self.note_failure(e))?;
        Ok(())
    }

    /// Sets `assignedTo`/`status`/timestamps on a job the Gateway lost
    /// track of (spec.md §4.2 "ForceAssign").
    pub async fn force_assign(&self, id: &str, our_did: &str) -> Result<(), DbError> {
        let now = bson::DateTime::from_chrono(Utc::now());
        self.update_job(
            id,
            doc! {
                "assigned_to": canonicalize_did(our_did),
                "status": "assigned",
                "assigned_date": now,
                "last_pinged": now,
            },
        )
        .await
    }

    /// Marks a job complete directly in the database when the Gateway's
    /// `finishJob` is unreachable or ambiguous (spec.md §4.2
    /// "ForceComplete").
    pub async fn force_complete(&self, id: &str, cid: &str) -> Result<(), DbError> {
        let now = bson::DateTime::from_chrono(Utc::now());
        self.update_job(
            id,
            doc! {
                "status": "complete",
                "completed_at": now,
                "result.cid": cid,
                "progress.pct": 100,
            },
        )
        .await
    }
}

fn log_format_inconsistency(owner: &str, our_did: &str) {
    eprintln!(
        "db-verifier: DID format inconsistency (treated as equal): db={owner} ours={our_did}"
    );
}

#[cfg(test)]
mod tests {
    use threespeak_core::compare_dids;

    #[test]
    fn format_mismatch_still_compares_equal() {
        let cmp = compare_dids("did:key:ABC", "didABC");
        assert!(cmp.equal);
    }
}
