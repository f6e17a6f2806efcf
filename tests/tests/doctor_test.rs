//! The doctor pipeline is the gate a deployment checks before trusting a
//! build for production execution; it must pass on a healthy host.

#[test]
fn health_check_passes_with_no_blockers_on_this_host() {
    let report = detcore::health();
    assert!(report.ok, "doctor blockers: {:?}", report.blockers);
}
