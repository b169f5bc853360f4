use sqlx::PgPool;

/// True when the given JWT ID has been revoked.
pub async fn is_token_revoked(db: &PgPool, jti: &str) -> Result<bool, sqlx::Error> {
    let found: Option<uuid::Uuid> =
        sqlx::query_scalar("SELECT id FROM revoked_tokens WHERE jti = $1")
            .bind(jti)
            .fetch_optional(db)
            .await?;
    Ok(found.is_some())
}

/// Revoke a JWT by its jti. Returns false when it was already revoked.
pub async fn revoke_token(
    db: &PgPool,
    jti: &str,
    reason: Option<&str>,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "INSERT INTO revoked_tokens (id, jti, reason) VALUES ($1, $2, $3) \
         ON CONFLICT (jti) DO NOTHING",
    )
    .bind(uuid::Uuid::now_v7())
    .bind(jti)
    .bind(reason)
    .execute(db)
    .await?;
    Ok(result.rows_affected() > 0)
}
