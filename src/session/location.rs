//! Delivery location setup.
//!
//! The storefront only lists merchants once an address is chosen, so every
//! live session starts here.

use crate::config::Config;
use crate::extract::cascade::{find_visible, wait_for_visible};
use crate::extract::Controls;
use crate::page::{PageDriver, PageError, Scope};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Picks the dropdown option that best matches the configured city.
///
/// Preference: city + state hint + a country hint, then city alone, then the
/// first option. Matching is case-insensitive.
pub fn choose_option(
    options: &[String],
    city: &str,
    state_hint: Option<&str>,
    country_hints: &[String],
) -> Option<usize> {
    if options.is_empty() {
        return None;
    }

    let city = city.to_lowercase();
    let state = state_hint.map(str::to_lowercase);
    let lowered: Vec<String> = options.iter().map(|o| o.to_lowercase()).collect();

    let full = lowered.iter().position(|o| {
        o.contains(&city)
            && state.as_deref().is_none_or(|s| o.contains(s))
            && (country_hints.is_empty()
                || country_hints.iter().any(|c| o.contains(&c.to_lowercase())))
    });

    full.or_else(|| lowered.iter().position(|o| o.contains(&city))).or(Some(0))
}

/// Text of the dropdown options under the first selector that lists any.
async fn dropdown_options(
    page: &dyn PageDriver,
    selectors: &[String],
    timeout: Duration,
) -> Result<Vec<(crate::page::ElementHandle, String)>, PageError> {
    let Some(first) = selectors.first() else {
        return Ok(Vec::new());
    };
    match crate::page::wait_for(page, Scope::Page, first, timeout).await {
        Ok(_) => {}
        Err(e) if e.is_transient() => debug!("address dropdown did not show: {}", e),
        Err(e) => return Err(e),
    }

    for selector in selectors {
        let handles = page.query_selector_all(Scope::Page, selector).await?;
        if handles.is_empty() {
            continue;
        }
        let mut options = Vec::with_capacity(handles.len());
        for handle in handles {
            let text = page.text(handle).await.unwrap_or_default();
            options.push((handle, text));
        }
        return Ok(options);
    }
    Ok(Vec::new())
}

async fn attempt(
    page: &dyn PageDriver,
    config: &Config,
    controls: &Controls,
) -> Result<(), PageError> {
    let timeout = Duration::from_millis(config.selector_timeout_ms);
    let settle = Duration::from_millis(config.settle_ms);

    let input = wait_for_visible(page, Scope::Page, &controls.address_input, timeout).await?;
    page.click(input).await?;
    page.fill(input, &config.city).await?;
    debug!("Typed '{}' into the address field", config.city);

    let options = dropdown_options(page, &controls.address_options, timeout).await?;
    let texts: Vec<String> = options.iter().map(|(_, text)| text.clone()).collect();
    match choose_option(&texts, &config.city, config.state_hint.as_deref(), &config.country_hints)
    {
        Some(index) => {
            let (handle, text) = &options[index];
            debug!("Choosing address option {} of {}: {}", index + 1, options.len(), text);
            page.click(*handle).await?;
        }
        None => {
            debug!("No address options; using the keyboard");
            page.press_key("ArrowDown").await?;
            tokio::time::sleep(Duration::from_millis(300)).await;
            page.press_key("Enter").await?;
        }
    }
    tokio::time::sleep(settle).await;

    // Confirmation dialogs vary; click whichever ones are up.
    for strategy in &controls.confirm_buttons {
        match find_visible(page, Scope::Page, std::slice::from_ref(strategy)).await {
            Ok(Some(button)) => {
                if let Err(e) = page.click(button).await {
                    debug!("{} click failed: {}", strategy.label(), e);
                } else {
                    debug!("Clicked {}", strategy.label());
                    tokio::time::sleep(settle).await;
                }
            }
            Ok(None) => {}
            Err(e) => debug!("{} lookup failed: {}", strategy.label(), e),
        }
    }
    Ok(())
}

/// Sets the delivery location, retrying up to `config.location_attempts`.
pub async fn configure(
    page: &dyn PageDriver,
    config: &Config,
    controls: &Controls,
) -> Result<(), PageError> {
    let mut last_error = None;

    for n in 1..=config.location_attempts {
        match attempt(page, config, controls).await {
            Ok(()) => {
                info!("Location set to {}", config.city);
                return Ok(());
            }
            Err(e) if e.is_transient() && n < config.location_attempts => {
                let delay = config.retry.backoff(n + 1);
                warn!("Location attempt {} failed: {}; retrying in {:?}", n, e, delay);
                last_error = Some(e);
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_error.unwrap_or(PageError::Timeout {
        what: "location setup".to_string(),
        timeout_ms: config.selector_timeout_ms,
    }))
}

/// Clicks the "Restaurants" tab if it is showing. Best-effort.
pub async fn open_restaurants(page: &dyn PageDriver, controls: &Controls, settle: Duration) {
    match find_visible(page, Scope::Page, &controls.restaurants_link).await {
        Ok(Some(link)) => match page.click(link).await {
            Ok(()) => {
                debug!("Opened the restaurants tab");
                tokio::time::sleep(settle).await;
            }
            Err(e) => debug!("Restaurants tab click failed: {}", e),
        },
        Ok(None) => debug!("No restaurants tab; staying on the current page"),
        Err(e) => debug!("Restaurants tab lookup failed: {}", e),
    }
}
