use dem_core::{
    midpoint_intersection, CameraExtrinsics, CameraIntrinsics, PinholeSensorModel, Ray,
    SensorModel,
};
use nalgebra::{Matrix3, Point2, Point3};

fn nadir_camera(center: Point3<f64>) -> PinholeSensorModel {
    // camera x = east, camera y = south, camera z = down
    let rotation = Matrix3::new(1.0, 0.0, 0.0, 0.0, -1.0, 0.0, 0.0, 0.0, -1.0);
    let intrinsics = CameraIntrinsics::new(500.0, 500.0, 320.0, 240.0, 640, 480);
    PinholeSensorModel::new(intrinsics, CameraExtrinsics::from_center(rotation, &center))
}

#[test]
fn test_pinhole_principal_point_hits_nadir() {
    let cam = nadir_camera(Point3::new(10.0, 20.0, 1000.0));
    let g = cam.forward(&Point2::new(320.0, 240.0), 0.0).unwrap();
    assert!((g.x - 10.0).abs() < 1e-9);
    assert!((g.y - 20.0).abs() < 1e-9);
    assert!(g.z.abs() < 1e-12);
}

#[test]
fn test_pinhole_forward_inverse_round_trip() {
    let cam = nadir_camera(Point3::new(0.0, 0.0, 800.0));
    let pixel = Point2::new(101.5, 377.25);
    for elevation in [-20.0, 0.0, 150.0] {
        let g = cam.forward(&pixel, elevation).unwrap();
        assert!((g.z - elevation).abs() < 1e-9);
        let back = cam.inverse(&g).unwrap();
        assert!((back - pixel).norm() < 1e-6);
    }
}

#[test]
fn test_pinhole_rejects_points_behind_camera() {
    let cam = nadir_camera(Point3::new(0.0, 0.0, 100.0));
    assert!(cam.forward(&Point2::new(320.0, 240.0), 200.0).is_none());
    assert!(cam.inverse(&Point3::new(0.0, 0.0, 150.0)).is_none());
}

#[test]
fn test_two_view_ray_triangulation() {
    let left = nadir_camera(Point3::new(-100.0, 0.0, 1000.0));
    let right = nadir_camera(Point3::new(100.0, 0.0, 1000.0));
    let target = Point3::new(12.0, -7.0, 42.0);

    let pl = left.inverse(&target).unwrap();
    let pr = right.inverse(&target).unwrap();
    let rays = [
        Ray::from_sensor(&left, &pl, 0.0, 100.0).unwrap(),
        Ray::from_sensor(&right, &pr, 0.0, 100.0).unwrap(),
    ];
    let p = midpoint_intersection(&rays).unwrap();
    assert!((p - target).norm() < 1e-6);
    assert!(rays[0].distance_to(&p) < 1e-6);
}
