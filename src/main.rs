use std::path::PathBuf;
use std::process::ExitCode;

use xpsfit::XpsError;
use xpsfit::fitter::fit::FitError;
use xpsfit::fitter::main_fitter::Fitter;
use xpsfit::reader::read_file;
use xpsfit::settings::AnalysisSettings;

fn run(spectrum: PathBuf, settings: Option<PathBuf>) -> Result<(), XpsError> {
    let settings = match settings {
        Some(path) => AnalysisSettings::load(&path)?,
        None => AnalysisSettings::default(),
    };

    let file = read_file(&spectrum)?;
    let region = file
        .region(&settings.region)
        .ok_or_else(|| XpsError::RegionNotFound(settings.region.clone()))?;

    let mut fitter = Fitter::from_region(region);
    settings.configure(&mut fitter);

    if let Some(baseline) = &settings.baseline {
        fitter.apply_shirley_baseline(baseline)?;
    }

    let prepared = settings.prepare(&mut fitter)?;

    let result = match fitter.fit(&prepared) {
        Ok(result) => result.clone(),
        Err(FitError::NoConvergence { best, .. }) => {
            println!("{}", best.fit_report());
            return Err(FitError::NoConvergence {
                nfev: best.nfev,
                best,
            }
            .into());
        }
        Err(e) => return Err(e.into()),
    };

    println!("{}", result.fit_report());
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init(); // Log to stderr (if you run with `RUST_LOG=debug`).

    let mut args = std::env::args_os().skip(1);
    let Some(spectrum) = args.next() else {
        eprintln!("usage: xpsfit <spectrum file> [settings.yaml]");
        return ExitCode::from(2);
    };
    let settings = args.next().map(PathBuf::from);

    match run(PathBuf::from(spectrum), settings) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
