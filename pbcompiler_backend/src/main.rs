use pbcompiler_backend::*;

fn main() -> Result<()> {
    let mut exp = Experiment::new();
    exp.add_pb_device("PB_ESR_PRO", 500e6, 21)?;
    exp.add_channel("PB_ESR_PRO", "aom", 0)?;
    exp.add_channel("PB_ESR_PRO", "laser", 1)?;
    exp.add_channel("PB_ESR_PRO", "sync", 2)?;

    exp.high("PB_ESR_PRO", "aom", 6., 10.)?;
    exp.pulse_train("PB_ESR_PRO", "laser", &[2., 16.], &[8., 14.])?;
    exp.set_all_off_padding("PB_ESR_PRO", 22.)?;
    let duration = exp.compile(true, 0)?;

    println!("{}", exp.device_print_insts("PB_ESR_PRO")?);
    println!("total: {duration} ns");
    for (name, (times, levels)) in exp.device_plot_lines("PB_ESR_PRO")? {
        println!("{name}: {times:?} {levels:?}");
    }
    Ok(())
}
