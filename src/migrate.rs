use anyhow::{Context, Result};

use crate::config::Config;
use crate::db;

/// Create the schema. Every statement is idempotent.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let dims = config.embedding.dims;
    anyhow::ensure!(dims > 0, "embedding.dims must be positive");

    sqlx::query("CREATE EXTENSION IF NOT EXISTS vector")
        .execute(&pool)
        .await
        .context("failed to enable the pgvector extension")?;

    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id BIGSERIAL PRIMARY KEY,
            text TEXT NOT NULL,
            metadata JSONB NOT NULL DEFAULT '{{}}'::jsonb,
            embedding VECTOR({dims}),
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#
    ))
    .execute(&pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS documents_embedding_idx \
         ON documents USING ivfflat (embedding vector_cosine_ops) WITH (lists = 100)",
    )
    .execute(&pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS documents_metadata_idx ON documents USING GIN (metadata)")
        .execute(&pool)
        .await?;

    // Kept for clients that call the similarity search as an RPC.
    sqlx::query(&format!(
        r#"
        CREATE OR REPLACE FUNCTION match_documents(
            query_embedding VECTOR({dims}),
            match_threshold FLOAT DEFAULT 0.0,
            match_count INT DEFAULT 10
        )
        RETURNS TABLE (id BIGINT, text TEXT, metadata JSONB, embedding VECTOR({dims}), similarity FLOAT)
        LANGUAGE SQL STABLE
        AS $$
            SELECT d.id, d.text, d.metadata, d.embedding,
                   1 - (d.embedding <=> query_embedding) AS similarity
            FROM documents d
            WHERE d.embedding IS NOT NULL
              AND 1 - (d.embedding <=> query_embedding) > match_threshold
            ORDER BY d.embedding <=> query_embedding
            LIMIT match_count
        $$
        "#
    ))
    .execute(&pool)
    .await?;

    sqlx::query(
        r#"
        CREATE OR REPLACE FUNCTION set_updated_at() RETURNS TRIGGER
        LANGUAGE plpgsql
        AS $$
        BEGIN
            NEW.updated_at = NOW();
            RETURN NEW;
        END;
        $$
        "#,
    )
    .execute(&pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS crawl_jobs (
            id UUID PRIMARY KEY,
            url TEXT NOT NULL,
            status TEXT NOT NULL
                CHECK (status IN ('pending', 'running', 'completed', 'failed', 'cancelled')),
            config JSONB NOT NULL DEFAULT '{}'::jsonb,
            result JSONB,
            error_message TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            queued_at TIMESTAMPTZ,
            started_at TIMESTAMPTZ,
            completed_at TIMESTAMPTZ
        )
        "#,
    )
    .execute(&pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS crawl_content (
            content_hash TEXT PRIMARY KEY,
            url_hash TEXT NOT NULL,
            job_id UUID NOT NULL REFERENCES crawl_jobs(id) ON DELETE CASCADE,
            url TEXT NOT NULL,
            title TEXT,
            content_size BIGINT NOT NULL,
            extracted_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(&pool)
    .await?;

    for sql in [
        "ALTER TABLE crawl_jobs ADD COLUMN IF NOT EXISTS queued_at TIMESTAMPTZ",
        "CREATE INDEX IF NOT EXISTS crawl_jobs_status_idx ON crawl_jobs(status)",
        "CREATE INDEX IF NOT EXISTS crawl_jobs_created_at_idx ON crawl_jobs(created_at DESC)",
        "CREATE INDEX IF NOT EXISTS crawl_content_url_hash_idx ON crawl_content(url_hash)",
        "DROP TRIGGER IF EXISTS documents_updated_at ON documents",
        "CREATE TRIGGER documents_updated_at BEFORE UPDATE ON documents \
         FOR EACH ROW EXECUTE FUNCTION set_updated_at()",
    ] {
        sqlx::query(sql).execute(&pool).await?;
    }

    pool.close().await;
    Ok(())
}
