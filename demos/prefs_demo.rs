use gosub_prefs::prefs::{CacheLookup, ContentPrefService, LoadContext, PrefEvent};
use gosub_prefs::{FailurePolicy, PrefStoreConfig, PrefsError};

#[tokio::main]
async fn main() -> Result<(), PrefsError> {
    env_logger::init();

    // Configure the store through the config builder, the same way an embedder
    // would per profile.
    let cfg = PrefStoreConfig::builder()
        .max_cached_entries(1024)
        .failure_policy(FailurePolicy::Resync)
        .build()
        .expect("PrefStoreConfig is not valid");

    let db = std::env::temp_dir().join("gosub-prefs-demo.sqlite");
    let prefs = ContentPrefService::open_sqlite(&db, cfg)?;
    println!("preference store {} at {}", prefs.id(), db.display());

    // Print every change once it has reached the database.
    let mut events = prefs.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(ev) = events.recv().await {
            match ev {
                PrefEvent::Set { key, value, .. } => println!("  stored  {key} = {value}"),
                PrefEvent::Removed { key, .. } => println!("  removed {key}"),
            }
        }
    });

    prefs.set("http://a.com/article", "zoom", 1.25, None)?;
    prefs.set("news.a.com", "zoom", 1.5, None)?;
    prefs.set("news.a.com", "zoom", 2.0, Some(LoadContext::Private))?;
    prefs.set_global("zoom", 1.0, None)?.wait().await?;

    for ctx in [None, Some(LoadContext::Private)] {
        let values = prefs.get_by_subdomain_and_name("a.com", "zoom", ctx).await?;
        println!("zoom under a.com ({ctx:?}): {values:?}");
    }

    // Removal is visible in the cache before the database has caught up.
    let done = prefs.remove_by_subdomain("a.com", None)?;
    match prefs.get_cached("news.a.com", "zoom", None)? {
        CacheLookup::Hit(v) => println!("still cached: {v}"),
        other => println!("news.a.com after removal: {other:?} ({:?})", done.state()),
    }
    done.wait().await?;

    println!("global zoom: {:?}", prefs.get_global("zoom", None).await?);
    println!("cache: {:?}", prefs.cache_stats());

    prefs.remove_all_globals(None)?.wait().await?;
    prefs.flush().await?;

    drop(prefs);
    let _ = printer.await;
    Ok(())
}
