//! Table definitions.
//!
//! Every record table carries a `natural_key` column with a UNIQUE
//! constraint; it is the only identity the storefront offers.

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS categories (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    link TEXT,
    city TEXT NOT NULL,
    natural_key TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS restaurants (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    city TEXT NOT NULL,
    category TEXT,
    cuisine TEXT,
    rating REAL,
    distance_km REAL,
    delivery_fee REAL,
    delivery_time_min INTEGER,
    min_order REAL,
    link TEXT,
    natural_key TEXT NOT NULL UNIQUE,
    scraped_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS products (
    id INTEGER PRIMARY KEY,
    restaurant_id INTEGER,
    restaurant_name TEXT NOT NULL,
    city TEXT NOT NULL,
    name TEXT NOT NULL,
    category TEXT,
    description TEXT,
    price REAL,
    natural_key TEXT NOT NULL UNIQUE,
    scraped_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS scraping_logs (
    id INTEGER PRIMARY KEY,
    timestamp TEXT NOT NULL,
    city TEXT NOT NULL,
    target TEXT NOT NULL,
    status TEXT NOT NULL,
    seen INTEGER NOT NULL,
    duplicates INTEGER NOT NULL,
    inserted INTEGER NOT NULL,
    errors INTEGER NOT NULL,
    duration_seconds REAL NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_categories_city ON categories(city);
CREATE INDEX IF NOT EXISTS idx_restaurants_city ON restaurants(city);
CREATE INDEX IF NOT EXISTS idx_products_restaurant ON products(restaurant_id);
"#;
