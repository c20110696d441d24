use std::path;
use std::process;
use std::time::Duration;

use bytesize::ByteSize;
use clap::ArgEnum;
use env_logger;
use log;

use netsort::{load_shard, write_shard, Cluster, FinalMerger, Framing, PartitionMap, ShuffleBuilder};

fn main() {
    let arg_parser = build_arg_parser();

    let log_level: LogLevel = arg_parser.value_of_t_or_exit("log_level");
    init_logger(log_level);

    let server_id: u32 = arg_parser.value_of_t_or_exit("server_id");
    let input = arg_parser.value_of("input").expect("value is required");
    let output = arg_parser.value_of("output").expect("value is required");
    let config = arg_parser.value_of("config").expect("value is required");

    let framing: FramingArg = arg_parser.value_of_t_or_exit("framing");
    let backoff: u64 = arg_parser.value_of_t_or_exit("backoff");
    let max_backoff: u64 = arg_parser.value_of_t_or_exit("max_backoff");
    let channel_capacity: usize = arg_parser.value_of_t_or_exit("channel_capacity");
    let timeout: Option<u64> = arg_parser
        .is_present("timeout")
        .then(|| arg_parser.value_of_t_or_exit("timeout"));
    let threads: Option<usize> = arg_parser
        .is_present("threads")
        .then(|| arg_parser.value_of_t_or_exit("threads"));
    let buf_size: Option<usize> = arg_parser.value_of("buffer_size").map(|v| {
        v.parse::<ByteSize>().expect("value is pre-validated").as_u64() as usize
    });

    let cluster = match Cluster::load(path::Path::new(config)) {
        Ok(cluster) => cluster,
        Err(err) => {
            log::error!("cluster config loading error: {}", err);
            process::exit(1);
        }
    };

    let mut shuffle_builder = ShuffleBuilder::new()
        .with_framing(framing.into())
        .with_backoff(Duration::from_millis(backoff), Duration::from_millis(max_backoff))
        .with_channel_capacity(channel_capacity);

    if let Some(timeout) = timeout {
        shuffle_builder = shuffle_builder.with_timeout(Duration::from_secs(timeout));
    }

    if let Some(buf_size) = buf_size {
        shuffle_builder = shuffle_builder.with_rw_buf_size(buf_size);
    }

    if let Some(listen_addr) = arg_parser.value_of("listen") {
        shuffle_builder = shuffle_builder.with_listen_addr(listen_addr);
    }

    let shuffle = match shuffle_builder.build(server_id, cluster) {
        Ok(shuffle) => shuffle,
        Err(err) => {
            log::error!("exchange initialization error: {}", err);
            process::exit(1);
        }
    };

    let merger = match FinalMerger::new(threads) {
        Ok(merger) => merger,
        Err(err) => {
            log::error!("merger initialization error: {}", err);
            process::exit(1);
        }
    };

    let records = match load_shard(path::Path::new(input), buf_size) {
        Ok(records) => records,
        Err(err) => {
            log::error!("input file reading error: {}", err);
            process::exit(1);
        }
    };

    let partitions = PartitionMap::build(records, shuffle.cluster().size());
    for node in shuffle.cluster().nodes() {
        log::debug!("partition of server {}: {} records", node.id, partitions.partition_len(node.id));
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            log::error!("runtime initialization error: {}", err);
            process::exit(1);
        }
    };

    let exchanged = match runtime.block_on(shuffle.run(partitions)) {
        Ok(exchanged) => exchanged,
        Err(err) => {
            log::error!("data exchange error: {}", err);
            process::exit(1);
        }
    };
    drop(runtime);

    let sorted = merger.merge(exchanged.received, exchanged.local);

    if let Err(err) = write_shard(path::Path::new(output), &sorted, buf_size) {
        log::error!("output file writing error: {}", err);
        process::exit(1);
    }
}

#[derive(Copy, Clone, clap::ArgEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn possible_values() -> impl Iterator<Item = clap::PossibleValue<'static>> {
        Self::value_variants().iter().filter_map(|v| v.to_possible_value())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <LogLevel as clap::ArgEnum>::from_str(s, false)
    }
}

#[derive(Copy, Clone, clap::ArgEnum)]
enum FramingArg {
    Sentinel,
    Tagged,
}

impl FramingArg {
    pub fn possible_values() -> impl Iterator<Item = clap::PossibleValue<'static>> {
        FramingArg::value_variants().iter().filter_map(|v| v.to_possible_value())
    }
}

impl std::str::FromStr for FramingArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <FramingArg as clap::ArgEnum>::from_str(s, false)
    }
}

impl From<FramingArg> for Framing {
    fn from(arg: FramingArg) -> Self {
        match arg {
            FramingArg::Sentinel => Framing::Sentinel,
            FramingArg::Tagged => Framing::Tagged,
        }
    }
}

fn build_arg_parser() -> clap::ArgMatches {
    clap::App::new("netsort")
        .about("distributed sorter of fixed-width records")
        .arg(
            clap::Arg::new("server_id")
                .help("id of this server in the cluster config")
                .required(true)
                .index(1),
        )
        .arg(
            clap::Arg::new("input")
                .help("local shard to be sorted")
                .required(true)
                .index(2),
        )
        .arg(
            clap::Arg::new("output")
                .help("file receiving the sorted records owned by this server")
                .required(true)
                .index(3),
        )
        .arg(
            clap::Arg::new("config")
                .help("cluster config file")
                .required(true)
                .index(4),
        )
        .arg(
            clap::Arg::new("framing")
                .short('f')
                .long("framing")
                .help("wire framing, must be the same on all servers")
                .takes_value(true)
                .default_value("tagged")
                .possible_values(FramingArg::possible_values()),
        )
        .arg(
            clap::Arg::new("timeout")
                .long("timeout")
                .help("seconds the data exchange may take before the run is aborted")
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("listen")
                .long("listen")
                .help("address to listen on instead of the one in the cluster config")
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("threads")
                .short('t')
                .long("threads")
                .help("number of threads to use for parallel sorting")
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("backoff")
                .long("backoff")
                .help("initial delay between connection attempts in milliseconds, at least 1")
                .takes_value(true)
                .default_value("10"),
        )
        .arg(
            clap::Arg::new("max_backoff")
                .long("max-backoff")
                .help("maximum delay between connection attempts in milliseconds")
                .takes_value(true)
                .default_value("1000"),
        )
        .arg(
            clap::Arg::new("channel_capacity")
                .long("channel-capacity")
                .help("number of received records buffered before readers are paused")
                .takes_value(true)
                .default_value("1024"),
        )
        .arg(
            clap::Arg::new("buffer_size")
                .short('b')
                .long("buffer-size")
                .help("socket and file read/write buffer size")
                .takes_value(true)
                .validator(|v| match v.parse::<ByteSize>() {
                    Ok(_) => Ok(()),
                    Err(err) => Err(format!("Buffer size format incorrect: {}", err)),
                }),
        )
        .arg(
            clap::Arg::new("log_level")
                .short('l')
                .long("loglevel")
                .help("logging level")
                .takes_value(true)
                .default_value("info")
                .possible_values(LogLevel::possible_values()),
        )
        .get_matches()
}

fn init_logger(log_level: LogLevel) {
    env_logger::Builder::new()
        .filter_level(match log_level {
            LogLevel::Off => log::LevelFilter::Off,
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        })
        .format_timestamp_millis()
        .init();
}
