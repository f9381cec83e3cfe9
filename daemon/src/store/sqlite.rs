use super::{RecordKey, Store};
use crate::db;
use crate::schema::*;
use diesel::prelude::*;
use pkgbuilderd_common::errors::*;
use std::collections::BTreeSet;

macro_rules! scoped {
    ($table:ident, $key:expr, $field:expr) => {
        $table::table
            .filter($table::namespace.eq($key.namespace))
            .filter($table::record_id.eq(&$key.id))
            .filter($table::field.eq($field))
    };
}

/// Store backed by the sqlite database of the daemon.
#[derive(Clone)]
pub struct SqliteStore {
    pool: db::Pool,
}

impl SqliteStore {
    pub fn open(url: &str) -> Result<SqliteStore> {
        let pool = db::setup_pool(url)?;
        Ok(SqliteStore { pool })
    }

    fn conn(&self) -> Result<db::Connection> {
        self.pool.get()
            .context("Failed to get connection from pool")
    }
}

impl Store for SqliteStore {
    fn get(&self, key: &RecordKey, field: &str) -> Result<Option<String>> {
        let mut conn = self.conn()?;
        let value = scoped!(record_fields, key, field)
            .select(record_fields::value)
            .first::<String>(&mut *conn)
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &RecordKey, field: &str, value: &str) -> Result<()> {
        let mut conn = self.conn()?;
        diesel::replace_into(record_fields::table)
            .values((
                record_fields::namespace.eq(key.namespace),
                record_fields::record_id.eq(&key.id),
                record_fields::field.eq(field),
                record_fields::value.eq(value),
            ))
            .execute(&mut *conn)?;
        Ok(())
    }

    fn delete(&self, key: &RecordKey, field: &str) -> Result<()> {
        let mut conn = self.conn()?;
        diesel::delete(scoped!(record_fields, key, field))
            .execute(&mut *conn)?;
        Ok(())
    }

    fn exists(&self, key: &RecordKey) -> Result<bool> {
        let mut conn = self.conn()?;
        let exists = diesel::select(diesel::dsl::exists(
            record_fields::table
                .filter(record_fields::namespace.eq(key.namespace))
                .filter(record_fields::record_id.eq(&key.id))
        ))
            .get_result::<bool>(&mut *conn)?;
        Ok(exists)
    }

    fn list_push(&self, key: &RecordKey, field: &str, value: &str) -> Result<()> {
        let mut conn = self.conn()?;
        diesel::insert_into(list_items::table)
            .values((
                list_items::namespace.eq(key.namespace),
                list_items::record_id.eq(&key.id),
                list_items::field.eq(field),
                list_items::value.eq(value),
            ))
            .execute(&mut *conn)?;
        Ok(())
    }

    fn list_items(&self, key: &RecordKey, field: &str) -> Result<Vec<String>> {
        let mut conn = self.conn()?;
        let items = scoped!(list_items, key, field)
            .order_by(list_items::id.asc())
            .select(list_items::value)
            .load::<String>(&mut *conn)?;
        Ok(items)
    }

    fn list_pop_front(&self, key: &RecordKey, field: &str) -> Result<Option<String>> {
        let mut conn = self.conn()?;
        conn.transaction::<_, Error, _>(|conn| {
            let row = scoped!(list_items, key, field)
                .order_by(list_items::id.asc())
                .select((list_items::id, list_items::value))
                .first::<(i32, String)>(conn)
                .optional()?;

            if let Some((id, value)) = row {
                diesel::delete(list_items::table.find(id))
                    .execute(conn)?;
                Ok(Some(value))
            } else {
                Ok(None)
            }
        })
    }

    fn list_remove(&self, key: &RecordKey, field: &str, value: &str) -> Result<usize> {
        let mut conn = self.conn()?;
        let n = diesel::delete(scoped!(list_items, key, field).filter(list_items::value.eq(value)))
            .execute(&mut *conn)?;
        Ok(n)
    }

    fn list_clear(&self, key: &RecordKey, field: &str) -> Result<()> {
        let mut conn = self.conn()?;
        diesel::delete(scoped!(list_items, key, field))
            .execute(&mut *conn)?;
        Ok(())
    }

    fn set_add(&self, key: &RecordKey, field: &str, value: &str) -> Result<bool> {
        let mut conn = self.conn()?;
        let n = diesel::insert_or_ignore_into(set_members::table)
            .values((
                set_members::namespace.eq(key.namespace),
                set_members::record_id.eq(&key.id),
                set_members::field.eq(field),
                set_members::value.eq(value),
            ))
            .execute(&mut *conn)?;
        Ok(n > 0)
    }

    fn set_remove(&self, key: &RecordKey, field: &str, value: &str) -> Result<bool> {
        let mut conn = self.conn()?;
        let n = diesel::delete(scoped!(set_members, key, field).filter(set_members::value.eq(value)))
            .execute(&mut *conn)?;
        Ok(n > 0)
    }

    fn set_members(&self, key: &RecordKey, field: &str) -> Result<BTreeSet<String>> {
        let mut conn = self.conn()?;
        let members = scoped!(set_members, key, field)
            .select(set_members::value)
            .load::<String>(&mut *conn)?;
        Ok(members.into_iter().collect())
    }

    fn set_contains(&self, key: &RecordKey, field: &str, value: &str) -> Result<bool> {
        let mut conn = self.conn()?;
        let exists = diesel::select(diesel::dsl::exists(
            scoped!(set_members, key, field).filter(set_members::value.eq(value))
        ))
            .get_result::<bool>(&mut *conn)?;
        Ok(exists)
    }

    fn set_clear(&self, key: &RecordKey, field: &str) -> Result<()> {
        let mut conn = self.conn()?;
        diesel::delete(scoped!(set_members, key, field))
            .execute(&mut *conn)?;
        Ok(())
    }

    fn incr(&self, counter: &str) -> Result<i64> {
        let mut conn = self.conn()?;
        conn.transaction::<_, Error, _>(|conn| {
            diesel::insert_or_ignore_into(counters::table)
                .values((counters::name.eq(counter), counters::value.eq(0i64)))
                .execute(conn)?;
            diesel::update(counters::table.find(counter))
                .set(counters::value.eq(counters::value + 1))
                .execute(conn)?;
            let value = counters::table.find(counter)
                .select(counters::value)
                .first::<i64>(conn)?;
            Ok(value)
        })
    }
}
