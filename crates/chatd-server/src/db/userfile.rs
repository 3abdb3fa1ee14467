//! `UserFiles`: content-addressed uploads with a reference count.

use chatd_pipeline::{first_i64, params, Payload, Result};

use crate::worker::{DbCtx, DbPipeline};

const INSERT: &str = "\
    INSERT INTO UserFiles(hash, size, mime_type) \
    VALUES ($1::text, $2::bigint, $3::varchar(32)) \
    ON CONFLICT (hash) DO UPDATE SET ref_count = UserFiles.ref_count + 1 \
    RETURNING ref_count;";
const SELECT_REF_COUNT: &str = "SELECT ref_count FROM UserFiles WHERE hash = $1::text;";
const DECREMENT: &str = "\
    UPDATE UserFiles SET ref_count = ref_count - 1 WHERE hash = $1::text \
    RETURNING ref_count, mime_type;";
const DELETE_UNREFERENCED: &str = "DELETE FROM UserFiles WHERE hash = $1::text AND ref_count <= 0;";

/// A file row after its count went down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Released {
    pub ref_count: i64,
    pub mime_type: String,
}

/// New row with count 1, or one more reference to an existing one.
/// Decodes to `RefCount`, the count this statement left behind.
pub fn insert(db: &mut DbPipeline, ctx: DbCtx, hash: &str, size: usize, mime: &str) -> Result<()> {
    db.submit_async(INSERT, &params![hash, size, mime], ctx.decode(first_i64))
}

/// Decodes to `RefCount`.
pub fn ref_count(db: &mut DbPipeline, ctx: DbCtx, hash: &str) -> Result<()> {
    db.submit_async(SELECT_REF_COUNT, &params![hash], ctx.decode(first_i64))
}

/// Decodes to `Data(Option<Released>)`, `None` for an unknown hash.
pub fn decrement(db: &mut DbPipeline, ctx: DbCtx, hash: &str) -> Result<()> {
    db.submit_async(
        DECREMENT,
        &params![hash],
        ctx.decode(|res| {
            if res.ntuples() == 0 {
                return Ok(Payload::data(None::<Released>));
            }
            let ref_count = res
                .parse::<i64>(0, 0)
                .ok_or_else(|| "ref_count is not a number".to_string())?;
            let mime_type = res.value(0, 1).unwrap_or_default().to_string();
            Ok(Payload::data(Some(Released {
                ref_count,
                mime_type,
            })))
        }),
    )
}

pub fn delete_unreferenced(db: &mut DbPipeline, ctx: DbCtx, hash: &str) -> Result<()> {
    db.submit_async(DELETE_UNREFERENCED, &params![hash], ctx)
}
