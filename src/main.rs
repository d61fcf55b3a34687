use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use s2pipe::config::{self, PipelineConfig};
use s2pipe::core::dn_offset::{self, BaselineOffsetTable};
use s2pipe::core::translate::{RasterTranslator, TranslateInput, TranslateOptions};
use s2pipe::core::workflow::{SeasonalDownloader, SeasonalRequest};
use s2pipe::io::{
    overlay_latlon_grid, write_grid, AoiBuilder, Authenticator, CancelFlag, CatalogueClient, CdseSession,
    Credentials, DownloadManager, GridOptions, HttpTransport, SceneNavigator,
};
use s2pipe::{BoundingBox, QueryWindow};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "s2pipe", version, about = "Sentinel-2 seasonal acquisition and correction pipeline")]
struct Cli {
    /// Debug-level logging
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Also append log output to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a rectangular AOI as GeoJSON
    Aoi {
        #[arg(long, allow_hyphen_values = true)]
        xmin: f64,
        #[arg(long, allow_hyphen_values = true)]
        xmax: f64,
        #[arg(long, allow_hyphen_values = true)]
        ymin: f64,
        #[arg(long, allow_hyphen_values = true)]
        ymax: f64,
        #[arg(long, default_value = "EPSG:4326")]
        crs: String,
        #[arg(long, default_value = "latlon_aoi.geojson")]
        out_file: PathBuf,
    },

    /// Overlay a regular lat/lon grid on an AOI
    Grid {
        /// AOI GeoJSON file
        #[arg(long)]
        aoi_file: PathBuf,
        /// Cell width in degrees of longitude
        #[arg(long)]
        dx_deg: f64,
        /// Cell height in degrees of latitude
        #[arg(long)]
        dy_deg: f64,
        /// Clip cells to the AOI outline
        #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
        clip_to_aoi: bool,
        #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
        fill_aoi_holes: bool,
        #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
        fill_cell_holes: bool,
        #[arg(long, default_value = "latlon_grid.geojson")]
        out_file: PathBuf,
    },

    /// Sentinel-2 tools
    #[command(subcommand)]
    S2(S2Commands),

    /// Materialize a VRT or raster as a tiled GeoTIFF
    Translate {
        input: PathBuf,
        output: PathBuf,
        /// Creation option KEY=VALUE (COMPRESS, BLOCKSIZE, PREDICTOR); repeatable
        #[arg(long = "co")]
        options: Vec<String>,
    },
}

#[derive(Subcommand, Debug)]
enum S2Commands {
    /// Download scenes over a seasonal window repeated across years
    #[command(alias = "download-seasonally")]
    Download(DownloadArgs),

    /// Build a VRT applying the processing-baseline DN offset to one band
    DnOffset(DnOffsetArgs),
}

#[derive(Args, Debug)]
struct Endpoints {
    #[arg(long, env = "S2PIPE_CATALOGUE_URL", default_value = config::DEFAULT_CATALOGUE_URL)]
    catalogue_url: String,
    #[arg(long, env = "S2PIPE_DOWNLOAD_URL", default_value = config::DEFAULT_DOWNLOAD_URL)]
    download_url: String,
    #[arg(long, env = "S2PIPE_AUTH_URL", default_value = config::DEFAULT_AUTH_URL)]
    auth_url: String,
    /// Secret file with `username` and `password`
    #[arg(long, env = "S2PIPE_CREDENTIALS")]
    credentials: Option<PathBuf>,
    /// Catalogue request timeout in seconds
    #[arg(long, default_value_t = 60)]
    catalogue_timeout: u64,
    /// Download request timeout in seconds
    #[arg(long, default_value_t = 300)]
    download_timeout: u64,
    #[arg(long, default_value_t = 200)]
    page_size: usize,
}

impl Endpoints {
    fn to_config(&self) -> Result<PipelineConfig> {
        let config = PipelineConfig {
            catalogue_url: self.catalogue_url.clone(),
            download_url: self.download_url.clone(),
            auth_url: self.auth_url.clone(),
            credentials_path: self.credentials.clone(),
            catalogue_timeout: Duration::from_secs(self.catalogue_timeout),
            download_timeout: Duration::from_secs(self.download_timeout),
            page_size: self.page_size,
            ..PipelineConfig::default()
        };
        config.validate()?;
        Ok(config)
    }
}

#[derive(Args, Debug)]
struct DownloadArgs {
    /// AOI GeoJSON file
    #[arg(long)]
    aoi: PathBuf,
    /// Output directory
    #[arg(long)]
    output: PathBuf,
    #[arg(long)]
    start_year: i32,
    #[arg(long, default_value_t = 6)]
    start_month: u32,
    #[arg(long, default_value_t = 1)]
    start_day: u32,
    #[arg(long)]
    end_year: i32,
    #[arg(long, default_value_t = 8)]
    end_month: u32,
    #[arg(long, default_value_t = 31)]
    end_day: u32,
    #[arg(long, default_value = config::DEFAULT_COLLECTION)]
    collection_name: String,
    #[arg(long, default_value = config::DEFAULT_PRODUCT_TYPE)]
    product_type: String,
    /// Bands to fetch, comma separated
    #[arg(long, value_delimiter = ',', default_values_t = config::DEFAULT_BANDS.map(String::from))]
    bands: Vec<String>,
    #[arg(long, default_value_t = 20)]
    target_res_m: u32,
    /// Skip the scene classification layer
    #[arg(long)]
    no_scl: bool,
    /// Stop after this many scenes
    #[arg(long)]
    max_scenes: Option<usize>,
    /// Concurrent file transfers per scene
    #[arg(long, default_value_t = 4)]
    max_workers_files: usize,
    /// Exit with status 2 if any scene, window or file failed
    #[arg(long)]
    strict: bool,
    #[command(flatten)]
    endpoints: Endpoints,
}

#[derive(Args, Debug)]
struct DnOffsetArgs {
    /// Band rasters (several are mosaicked)
    #[arg(required = true)]
    sources: Vec<PathBuf>,
    #[arg(long)]
    band: String,
    /// Offset to add; derived from the processing baseline when omitted
    #[arg(long, allow_hyphen_values = true)]
    offset: Option<f64>,
    /// TOML table of baseline offsets replacing the built-in one
    #[arg(long)]
    baseline_table: Option<PathBuf>,
    /// Output VRT path
    #[arg(long)]
    out: Option<PathBuf>,
    /// Also materialize the VRT as a GeoTIFF here
    #[arg(long)]
    translate_to: Option<PathBuf>,
    #[arg(long = "co")]
    options: Vec<String>,
}

/// Writes log lines to stderr and a file
struct Tee {
    file: File,
}

impl Write for Tee {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        std::io::stderr().write_all(buf)?;
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        std::io::stderr().flush()?;
        self.file.flush()
    }
}

fn init_logging(verbose: bool, log_file: Option<&PathBuf>) -> Result<()> {
    let level = if verbose { "debug" } else { "info" };
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level));
    if let Some(path) = log_file {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening log file {}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(Tee { file })));
    }
    builder.init();
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = init_logging(cli.verbose, cli.log_file.as_ref()) {
        eprintln!("{:?}", e);
        return ExitCode::from(1);
    }

    match run(cli.command) {
        Ok(code) => code,
        Err(e) => {
            log::error!("❌ {:#}", e);
            ExitCode::from(1)
        }
    }
}

fn run(command: Commands) -> Result<ExitCode> {
    match command {
        Commands::Aoi { xmin, xmax, ymin, ymax, crs, out_file } => {
            AoiBuilder::create(&BoundingBox::new(xmin, ymin, xmax, ymax), &crs, &out_file)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Grid {
            aoi_file,
            dx_deg,
            dy_deg,
            clip_to_aoi,
            fill_aoi_holes,
            fill_cell_holes,
            out_file,
        } => {
            let aoi = AoiBuilder::load(&aoi_file).with_context(|| format!("loading AOI {}", aoi_file.display()))?;
            let options = GridOptions {
                dx_deg,
                dy_deg,
                clip_to_aoi,
                fill_aoi_holes,
                fill_cell_holes,
            };
            let cells = overlay_latlon_grid(&aoi, &options)?;
            write_grid(&cells, &out_file)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::S2(S2Commands::Download(args)) => download(args),
        Commands::S2(S2Commands::DnOffset(args)) => dn_offset(args),
        Commands::Translate { input, output, options } => {
            let options = TranslateOptions::parse(&options)?;
            RasterTranslator::materialize(&TranslateInput::Raster(input), &output, &options)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn download(args: DownloadArgs) -> Result<ExitCode> {
    let config = args.endpoints.to_config()?;
    let aoi = AoiBuilder::load(&args.aoi).with_context(|| format!("loading AOI {}", args.aoi.display()))?;

    // Dates of the template are replaced per season window
    let placeholder = chrono::NaiveDate::from_ymd_opt(args.start_year, 1, 1)
        .with_context(|| format!("invalid start year {}", args.start_year))?;
    let template = QueryWindow::new(
        placeholder,
        placeholder,
        args.collection_name.clone(),
        args.product_type.clone(),
        args.bands.iter().map(|b| b.trim().to_string()),
        args.target_res_m,
    )?;
    let request = SeasonalRequest {
        aoi,
        output_root: args.output.clone(),
        start: (args.start_year, args.start_month, args.start_day),
        end: (args.end_year, args.end_month, args.end_day),
        template,
        include_scl: !args.no_scl,
        max_workers: args.max_workers_files,
    };
    // Fail on bad dates before any network traffic
    SeasonalDownloader::plan_windows(&request)?;

    let session = match &config.credentials_path {
        Some(path) => {
            let credentials = Credentials::from_file(path)?;
            let auth = Authenticator::new(config.auth_url.clone(), credentials, config.catalogue_timeout)?;
            CdseSession::authenticated(&config, auth)?
        }
        None => {
            log::warn!("No credentials given; product downloads will likely be refused");
            CdseSession::anonymous(&config)?
        }
    };
    let transport: Arc<dyn HttpTransport> = Arc::new(session);

    let cancel = CancelFlag::new();
    let flag = cancel.clone();
    ctrlc::set_handler(move || {
        log::warn!("Received Ctrl+C, finishing in-flight transfers...");
        flag.cancel();
    })
    .context("installing Ctrl+C handler")?;

    let catalogue = CatalogueClient::new(transport.clone(), &config).with_max_scenes(args.max_scenes);
    let navigator = SceneNavigator::new(transport.clone(), config.download_url(), config.download_retry);
    let downloads = DownloadManager::new(transport, config.download_retry).with_cancel_flag(cancel);

    let report = SeasonalDownloader::new(&catalogue, &navigator, &downloads).run(&request)?;
    if args.strict && !report.is_clean() {
        log::warn!("Some scenes, windows or files failed (see download_report.json)");
        return Ok(ExitCode::from(2));
    }
    Ok(ExitCode::SUCCESS)
}

fn dn_offset(args: DnOffsetArgs) -> Result<ExitCode> {
    let offset = match args.offset {
        Some(offset) => offset,
        None => {
            let table = match &args.baseline_table {
                Some(path) => BaselineOffsetTable::from_toml_file(path)?,
                None => BaselineOffsetTable::default(),
            };
            let mut offsets = args
                .sources
                .iter()
                .map(|p| dn_offset::offset_for_path(&table, p))
                .collect::<s2pipe::S2Result<Vec<f64>>>()?;
            offsets.sort_by(|a, b| a.total_cmp(b));
            offsets.dedup();
            if offsets.len() != 1 {
                bail!("sources come from baselines with different offsets {:?}; pass --offset", offsets);
            }
            offsets[0]
        }
    };

    let out = args
        .out
        .clone()
        .unwrap_or_else(|| dn_offset::default_vrt_dir().join(format!("{}_offset.vrt", args.band)));
    let vrt = dn_offset::build_offset_vrt(&args.sources, &args.band, offset, &out)?;

    if let Some(dest) = &args.translate_to {
        let options = TranslateOptions::parse(&args.options)?;
        RasterTranslator::materialize(&TranslateInput::Vrt(vrt), dest, &options)?;
    }
    Ok(ExitCode::SUCCESS)
}
