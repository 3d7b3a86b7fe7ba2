//! Upsert-by-name package storage and lifecycle-script upserts.

use sqlx::PgPool;
use uuid::Uuid;

use crate::schema::{Package, PackageScript};

/// Handle to the `packages` and `package_scripts` tables.
#[derive(Debug, Clone)]
pub struct PackageStore {
    pool: PgPool,
}

impl PackageStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert or update the row for `pkg.name` and return its id.
    ///
    /// Runs as one transaction: look the name up, update every attribute
    /// column in place if it exists, insert otherwise. The unique index on
    /// `name` serializes concurrent writers; an insert that loses the race
    /// converts into an update, so last writer wins either way.
    pub async fn store_package(&self, pkg: &Package) -> Result<Uuid, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query_scalar::<_, Uuid>("SELECT id FROM packages WHERE name = $1")
            .bind(&pkg.name)
            .fetch_optional(&mut *tx)
            .await?;

        let package_id = match existing {
            Some(id) => {
                sqlx::query(
                    r"
                    UPDATE packages SET
                        version = $2,
                        description = $3,
                        author = $4,
                        homepage = $5,
                        repository = $6,
                        license = $7,
                        created_at = $8,
                        updated_at = $9,
                        downloads = $10,
                        popularity_score = $11,
                        last_updated = NOW()
                    WHERE id = $1
                    ",
                )
                .bind(id)
                .bind(&pkg.version)
                .bind(&pkg.description)
                .bind(&pkg.author)
                .bind(&pkg.homepage)
                .bind(&pkg.repository)
                .bind(&pkg.license)
                .bind(pkg.created_at)
                .bind(pkg.updated_at)
                .bind(pkg.downloads)
                .bind(pkg.popularity_score)
                .execute(&mut *tx)
                .await?;
                id
            }
            None => {
                sqlx::query_scalar::<_, Uuid>(
                    r"
                    INSERT INTO packages (
                        name, version, description, author, homepage, repository,
                        license, created_at, updated_at, downloads, popularity_score, last_updated
                    ) VALUES (
                        $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, NOW()
                    )
                    ON CONFLICT (name) DO UPDATE SET
                        version = $2,
                        description = $3,
                        author = $4,
                        homepage = $5,
                        repository = $6,
                        license = $7,
                        created_at = $8,
                        updated_at = $9,
                        downloads = $10,
                        popularity_score = $11,
                        last_updated = NOW()
                    RETURNING id
                    ",
                )
                .bind(&pkg.name)
                .bind(&pkg.version)
                .bind(&pkg.description)
                .bind(&pkg.author)
                .bind(&pkg.homepage)
                .bind(&pkg.repository)
                .bind(&pkg.license)
                .bind(pkg.created_at)
                .bind(pkg.updated_at)
                .bind(pkg.downloads)
                .bind(pkg.popularity_score)
                .fetch_one(&mut *tx)
                .await?
            }
        };

        tx.commit().await?;
        Ok(package_id)
    }

    /// Upsert a script body keyed on `(package_id, script_type)`.
    ///
    /// Content and `updated_at` are overwritten on conflict. Scripts absent
    /// upstream are never deleted here; the store is upsert-only.
    pub async fn store_script(&self, script: &PackageScript) -> Result<(), sqlx::Error> {
        sqlx::query(
            r"
            INSERT INTO package_scripts (package_id, script_type, content, created_at, updated_at)
            VALUES ($1, $2, $3, NOW(), NOW())
            ON CONFLICT (package_id, script_type) DO UPDATE SET
                content = $3,
                updated_at = NOW()
            ",
        )
        .bind(script.package_id)
        .bind(script.script_type.as_str())
        .bind(&script.content)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
