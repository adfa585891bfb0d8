#![deny(unsafe_code)]

use std::path::Path;
use std::process;
use std::sync::Arc;

use anyhow::anyhow;
use structopt::StructOpt;

use imq::conf::{Options, PersistMethod, Settings};
use imq::logger::logger_init;
use imq::net::{Builder, Listener};
use imq::persist::{FilePersist, MemPersist, NonePersist, PersistHandle};
use imq::{Result, ServerContext, Supervisor};

#[tokio::main]
async fn main() {
    //init config
    let settings = match Settings::init(Options::from_args()) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("settings init failed, {e:?}");
            process::exit(1);
        }
    };

    //init log
    let _guard = match logger_init(&settings.log) {
        Ok(g) => g,
        Err(e) => {
            eprintln!("logger init failed, {e:?}");
            process::exit(1);
        }
    };

    let _ = Settings::logs();

    if let Err(e) = serve(settings).await {
        log::error!("imq stopped, {e:?}");
        process::exit(1);
    }
}

async fn serve(settings: &Settings) -> Result<()> {
    let (inbound, outbound) = stores(settings).await?;
    let scx = ServerContext::new()
        .inbound(inbound)
        .outbound(outbound)
        .version(settings.mqtt.protocol_version()?)
        .compatible(settings.mqtt.compatible)
        .build();

    let mut sup = Supervisor::new(scx.clone()).grace(settings.listener.grace_shutdown_time);
    for l in listeners(settings)? {
        log::info!("{} listening on {}", l.typ.as_str(), l.local_addr);
        sup = sup.listener(l);
    }
    let sup = sup.build();

    let mut running = {
        let sup = sup.clone();
        tokio::spawn(async move { sup.run().await })
    };

    let stopped = tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res?;
            log::info!("interrupted, stop accepting connections");
            sup.shutdown();
            false
        }
        res = &mut running => {
            res??;
            true
        }
    };

    //bounded by the grace time
    let grace = settings.listener.grace_shutdown_time;
    if !stopped && tokio::time::timeout(grace, running).await.is_err() {
        log::warn!("listeners still running after {grace:?}");
    }
    if !scx.registry.is_empty() {
        log::info!("exiting with {} connections still open", scx.registry.len());
    }

    for store in [&scx.inbound, &scx.outbound] {
        if let Err(e) = store.flush().await {
            log::warn!("{} store flush failed, {e}", store.name());
        }
    }
    log::info!("imq stopped");
    Ok(())
}

async fn stores(settings: &Settings) -> Result<(PersistHandle, PersistHandle)> {
    let cfg = &settings.persist;
    let strategy = cfg.strategy();
    let stores: (PersistHandle, PersistHandle) = match cfg.method {
        PersistMethod::None => (Arc::new(NonePersist), Arc::new(NonePersist)),
        PersistMethod::Memory => (Arc::new(MemPersist::new(strategy)), Arc::new(MemPersist::new(strategy))),
        PersistMethod::File => {
            if cfg.file_path.is_empty() {
                return Err(anyhow!("persist.file_path is required by the file persist method"));
            }
            let dir = Path::new(&cfg.file_path);
            (
                Arc::new(FilePersist::open(dir.join("inbound"), strategy).await?),
                Arc::new(FilePersist::open(dir.join("outbound"), strategy).await?),
            )
        }
        PersistMethod::Redis | PersistMethod::Etcd => {
            return Err(anyhow!("persist method {:?} is not supported", cfg.method));
        }
    };
    log::info!("persist stores are {}", stores.0.name());
    Ok(stores)
}

fn listeners(settings: &Settings) -> Result<Vec<Listener>> {
    let cfg = &settings.listener;
    let mut listeners = Vec::new();
    if cfg.tcp > 0 {
        listeners.push(builder(settings, "external/tcp", cfg.tcp, cfg.max_tcp).bind()?.tcp()?);
    }
    #[cfg(feature = "tls")]
    if cfg.tcps > 0 {
        listeners.push(builder(settings, "external/tls", cfg.tcps, cfg.max_tcps).bind()?.tls()?);
    }
    #[cfg(feature = "ws")]
    if cfg.ws > 0 {
        listeners.push(builder(settings, "external/ws", cfg.ws, cfg.max_ws).bind()?.ws()?);
    }
    #[cfg(all(feature = "tls", feature = "ws"))]
    if cfg.wss > 0 {
        listeners.push(builder(settings, "external/wss", cfg.wss, cfg.max_wss).bind()?.wss()?);
    }
    if listeners.is_empty() {
        return Err(anyhow!("every listener port is 0, nothing to serve"));
    }
    Ok(listeners)
}

fn builder(settings: &Settings, name: &str, port: u16, max_connections: usize) -> Builder {
    let mqtt = &settings.mqtt;
    let listener = &settings.listener;
    Builder::new()
        .name(name)
        .laddr(listener.addr(port))
        .backlog(listener.backlog)
        .nodelay(listener.nodelay)
        .reuseaddr(Some(listener.reuseaddr))
        .max_connections(max_connections)
        .max_packet_size(mqtt.max_packet_size)
        .keepalive_backoff(mqtt.keepalive_backoff)
        .handshake_timeout(mqtt.handshake_timeout)
        .send_timeout(mqtt.send_timeout)
        .max_mqueue_len(mqtt.max_mqueue_len)
        .tls_cert(Some(listener.tls_cert.as_str()))
        .tls_key(Some(listener.tls_key.as_str()))
}
